use mockito::{Matcher, Mock, ServerGuard};
use postbox::errors::{AppError, UpstreamError};
use postbox::gmail::GmailClient;
use postbox::oauth::{TokenManager, TokenRecord};
use postbox::sync::{Mailbox, PrefetchOutcome, PrefetchState, SyncPolicy};
use postbox::types::now_ms;
use std::time::Duration;

fn mailbox(server: &ServerGuard, prefetch_delay: Duration) -> Mailbox {
    // The token never expires here, so the token endpoint is never contacted.
    mailbox_with_token(
        server,
        prefetch_delay,
        TokenRecord::new("access", None, i64::MAX),
        "http://127.0.0.1:9/token",
    )
}

fn mailbox_with_token(
    server: &ServerGuard,
    prefetch_delay: Duration,
    token: TokenRecord,
    token_url: &str,
) -> Mailbox {
    let client =
        GmailClient::new(format!("{}/gmail/v1", server.url()), Duration::from_secs(5)).unwrap();
    let tokens = TokenManager::new(
        "client-id",
        None,
        "https://accounts.example.com/auth",
        token_url,
        Duration::from_secs(5),
    )
    .unwrap();
    let policy = SyncPolicy {
        prefetch_delay,
        ..SyncPolicy::default()
    };
    Mailbox::new(client, tokens, policy, token)
}

fn ids(mailbox: &Mailbox) -> Vec<String> {
    mailbox.messages().iter().map(|m| m.id.clone()).collect()
}

fn expected_ids(range: std::ops::Range<usize>) -> Vec<String> {
    range.map(|i| format!("m{i}")).collect()
}

fn page_body(ids: std::ops::Range<usize>, next: &str) -> String {
    let messages: Vec<serde_json::Value> = ids
        .map(|i| serde_json::json!({"id": format!("m{i}"), "threadId": format!("t{i}")}))
        .collect();
    serde_json::json!({"messages": messages, "nextPageToken": next}).to_string()
}

fn last_page_body(ids: std::ops::Range<usize>) -> String {
    let messages: Vec<serde_json::Value> = ids
        .map(|i| serde_json::json!({"id": format!("m{i}"), "threadId": format!("t{i}")}))
        .collect();
    serde_json::json!({ "messages": messages }).to_string()
}

/// Final page behind `pageToken=p2`, answered after `delay`.
async fn mock_slow_last_page(server: &mut ServerGuard, delay: Duration, hits: usize) -> Mock {
    let body = last_page_body(15..45);
    server
        .mock("GET", "/gmail/v1/users/me/messages")
        .match_query(Matcher::UrlEncoded("pageToken".into(), "p2".into()))
        .with_status(200)
        .with_body_from_request(move |_| {
            std::thread::sleep(delay);
            body.clone().into_bytes()
        })
        .expect(hits)
        .create_async()
        .await
}

async fn mock_metadata(server: &mut ServerGuard) -> Mock {
    server
        .mock("GET", Matcher::Regex(r"^/gmail/v1/users/me/messages/m\d+".into()))
        .match_query(Matcher::UrlEncoded("format".into(), "metadata".into()))
        .with_status(200)
        .with_body_from_request(|req| {
            let id = req
                .path()
                .rsplit('/')
                .next()
                .and_then(|tail| tail.split('?').next())
                .unwrap_or_default()
                .to_string();
            serde_json::json!({
                "id": id,
                "threadId": format!("t-{id}"),
                "labelIds": ["INBOX", "UNREAD"],
                "snippet": format!("snippet {id}"),
                "payload": {"headers": [{"name": "Subject", "value": format!("Subject {id}")}]}
            })
            .to_string()
            .into_bytes()
        })
        .create_async()
        .await
}

async fn mock_first_page(server: &mut ServerGuard, hits: usize) -> Mock {
    server
        .mock("GET", "/gmail/v1/users/me/messages")
        .match_query(Matcher::Regex("^maxResults=15$".into()))
        .with_status(200)
        .with_body(page_body(0..15, "p2"))
        .expect(hits)
        .create_async()
        .await
}

async fn mock_page(
    server: &mut ServerGuard,
    token: &str,
    max_results: usize,
    ids: std::ops::Range<usize>,
    next: &str,
) -> Mock {
    server
        .mock("GET", "/gmail/v1/users/me/messages")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("pageToken".into(), token.into()),
            Matcher::UrlEncoded("maxResults".into(), max_results.to_string()),
        ]))
        .with_status(200)
        .with_body(page_body(ids, next))
        .create_async()
        .await
}

#[tokio::test]
async fn background_prefetch_fills_the_mailbox_up_to_the_cap() {
    let mut server = mockito::Server::new_async().await;
    let _metadata = mock_metadata(&mut server).await;
    let _first = mock_first_page(&mut server, 1).await;
    let p2 = mock_page(&mut server, "p2", 30, 15..45, "p3").await;
    let p3 = mock_page(&mut server, "p3", 30, 45..75, "p4").await;
    let p4 = mock_page(&mut server, "p4", 30, 75..105, "p5").await;
    let p5 = mock_page(&mut server, "p5", 15, 105..120, "p6").await;
    let beyond_cap = server
        .mock("GET", "/gmail/v1/users/me/messages")
        .match_query(Matcher::UrlEncoded("pageToken".into(), "p6".into()))
        .expect(0)
        .create_async()
        .await;

    let mut mailbox = mailbox(&server, Duration::from_millis(10));
    let first = mailbox.load_initial().await.unwrap();
    assert_eq!(first.len(), 15);
    assert_eq!(mailbox.state(), PrefetchState::Scheduled);

    mailbox.drain().await.unwrap();

    let ids: Vec<String> = mailbox.messages().iter().map(|m| m.id.clone()).collect();
    let expected: Vec<String> = (0..120).map(|i| format!("m{i}")).collect();
    assert_eq!(ids, expected);
    assert_eq!(mailbox.cursor().total_fetched, 120);
    assert_eq!(mailbox.state(), PrefetchState::Idle);
    assert!(mailbox.messages().iter().all(|m| m.is_unread));
    assert_eq!(mailbox.messages()[7].subject, "Subject m7");

    for mock in [p2, p3, p4, p5, beyond_cap] {
        mock.assert_async().await;
    }
}

#[tokio::test]
async fn refresh_all_cancels_a_scheduled_fetch() {
    let mut server = mockito::Server::new_async().await;
    let _metadata = mock_metadata(&mut server).await;
    let first = mock_first_page(&mut server, 2).await;
    let p2 = server
        .mock("GET", "/gmail/v1/users/me/messages")
        .match_query(Matcher::UrlEncoded("pageToken".into(), "p2".into()))
        .expect(0)
        .create_async()
        .await;

    let mut mailbox = mailbox(&server, Duration::from_secs(60));
    mailbox.load_initial().await.unwrap();
    assert_eq!(mailbox.state(), PrefetchState::Scheduled);

    let reloaded = mailbox.refresh_all().await.unwrap();
    assert_eq!(reloaded.len(), 15);
    assert_eq!(mailbox.cursor().total_fetched, 15);
    assert_eq!(mailbox.state(), PrefetchState::Scheduled);

    drop(mailbox);
    first.assert_async().await;
    p2.assert_async().await;
}

#[tokio::test]
async fn load_more_takes_over_a_scheduled_fetch() {
    let mut server = mockito::Server::new_async().await;
    let _metadata = mock_metadata(&mut server).await;
    let _first = mock_first_page(&mut server, 1).await;
    let p2 = mock_page(&mut server, "p2", 30, 15..45, "p3").await;

    let mut mailbox = mailbox(&server, Duration::from_secs(60));
    mailbox.load_initial().await.unwrap();

    let appended = mailbox.load_more().await.unwrap();
    assert_eq!(appended, 30);
    assert_eq!(mailbox.messages().len(), 45);
    assert_eq!(mailbox.messages()[15].id, "m15");
    assert_eq!(mailbox.cursor().next_page_token.as_deref(), Some("p3"));
    assert_eq!(mailbox.state(), PrefetchState::Scheduled);
    p2.assert_async().await;
}

#[tokio::test]
async fn failed_background_fetch_halts_prefetch() {
    let mut server = mockito::Server::new_async().await;
    let _metadata = mock_metadata(&mut server).await;
    let _first = mock_first_page(&mut server, 1).await;
    let p2 = server
        .mock("GET", "/gmail/v1/users/me/messages")
        .match_query(Matcher::UrlEncoded("pageToken".into(), "p2".into()))
        .with_status(503)
        .expect(1)
        .create_async()
        .await;

    let mut mailbox = mailbox(&server, Duration::from_millis(10));
    mailbox.load_initial().await.unwrap();

    let err = mailbox.drain().await.unwrap_err();
    assert!(matches!(
        err,
        AppError::Upstream(UpstreamError::ServerError(503))
    ));
    assert_eq!(mailbox.messages().len(), 15);
    assert_eq!(mailbox.state(), PrefetchState::Idle);
    assert!(mailbox.next_event().await.is_none());
    p2.assert_async().await;
}

#[tokio::test]
async fn short_mailbox_stops_when_pages_run_out() {
    let mut server = mockito::Server::new_async().await;
    let _metadata = mock_metadata(&mut server).await;
    let _mock = server
        .mock("GET", "/gmail/v1/users/me/messages")
        .with_status(200)
        .with_body(r#"{"messages":[{"id":"m0","threadId":"t0"},{"id":"m1","threadId":"t1"}]}"#)
        .create_async()
        .await;

    let mut mailbox = mailbox(&server, Duration::from_millis(10));
    mailbox.load_initial().await.unwrap();
    assert_eq!(mailbox.messages().len(), 2);
    assert_eq!(mailbox.state(), PrefetchState::Idle);
    assert!(mailbox.next_event().await.is_none());
    assert_eq!(mailbox.load_more().await.unwrap(), 0);
}

#[tokio::test]
async fn reloading_orphans_a_fetch_that_already_started() {
    let mut server = mockito::Server::new_async().await;
    let _metadata = mock_metadata(&mut server).await;
    let first = mock_first_page(&mut server, 2).await;
    let p2 = mock_slow_last_page(&mut server, Duration::from_millis(50), 2).await;

    let mut mailbox = mailbox(&server, Duration::from_millis(10));
    mailbox.load_initial().await.unwrap();
    assert!(matches!(
        mailbox.next_event().await,
        Some(PrefetchOutcome::Started)
    ));
    assert_eq!(mailbox.state(), PrefetchState::Fetching);

    mailbox.load_initial().await.unwrap();
    assert_eq!(ids(&mailbox), expected_ids(0..15));
    assert_eq!(mailbox.cursor().total_fetched, 15);

    mailbox.drain().await.unwrap();
    assert_eq!(ids(&mailbox), expected_ids(0..45));
    assert_eq!(mailbox.cursor().total_fetched, mailbox.messages().len());
    assert_eq!(mailbox.cursor().next_page_token, None);
    assert_eq!(mailbox.state(), PrefetchState::Idle);

    first.assert_async().await;
    p2.assert_async().await;
}

#[tokio::test]
async fn refresh_all_discards_a_running_fetch() {
    let mut server = mockito::Server::new_async().await;
    let _metadata = mock_metadata(&mut server).await;
    let _first = mock_first_page(&mut server, 2).await;
    let p2 = mock_slow_last_page(&mut server, Duration::from_millis(200), 2).await;

    let mut mailbox = mailbox(&server, Duration::from_millis(10));
    mailbox.load_initial().await.unwrap();
    assert!(matches!(
        mailbox.next_event().await,
        Some(PrefetchOutcome::Started)
    ));
    assert_eq!(mailbox.state(), PrefetchState::Fetching);

    let reloaded = mailbox.refresh_all().await.unwrap();
    assert_eq!(reloaded.len(), 15);

    mailbox.drain().await.unwrap();
    // One copy of the second page, not two.
    assert_eq!(ids(&mailbox), expected_ids(0..45));
    assert_eq!(mailbox.cursor().total_fetched, 45);
    p2.assert_async().await;
}

#[tokio::test]
async fn load_more_is_a_no_op_while_a_fetch_runs() {
    let mut server = mockito::Server::new_async().await;
    let _metadata = mock_metadata(&mut server).await;
    let _first = mock_first_page(&mut server, 1).await;
    let p2 = mock_slow_last_page(&mut server, Duration::from_millis(200), 1).await;

    let mut mailbox = mailbox(&server, Duration::from_millis(10));
    mailbox.load_initial().await.unwrap();
    assert!(matches!(
        mailbox.next_event().await,
        Some(PrefetchOutcome::Started)
    ));

    assert_eq!(mailbox.load_more().await.unwrap(), 0);
    assert_eq!(mailbox.messages().len(), 15);

    assert!(matches!(
        mailbox.next_event().await,
        Some(PrefetchOutcome::Appended(30))
    ));
    assert_eq!(ids(&mailbox), expected_ids(0..45));
    assert!(mailbox.next_event().await.is_none());
    p2.assert_async().await;
}

#[tokio::test]
async fn background_fetch_refreshes_an_expiring_token() {
    let mut server = mockito::Server::new_async().await;
    let _metadata = mock_metadata(&mut server).await;
    let _first = mock_first_page(&mut server, 1).await;
    let refresh = server
        .mock("POST", "/token")
        .match_body(Matcher::UrlEncoded("refresh_token".into(), "r1".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"fresh","expires_in":3599,"token_type":"Bearer"}"#)
        .expect(1)
        .create_async()
        .await;
    let p2 = server
        .mock("GET", "/gmail/v1/users/me/messages")
        .match_query(Matcher::UrlEncoded("pageToken".into(), "p2".into()))
        .match_header("authorization", "Bearer fresh")
        .with_status(200)
        .with_body(last_page_body(15..45))
        .create_async()
        .await;

    // Valid for the first page, expired by the time the prefetch delay runs out.
    let token = TokenRecord::new("access", Some("r1".into()), now_ms() + 300);
    let mut mailbox = mailbox_with_token(
        &server,
        Duration::from_millis(800),
        token,
        &format!("{}/token", server.url()),
    );
    mailbox.load_initial().await.unwrap();
    mailbox.drain().await.unwrap();

    assert_eq!(mailbox.token().bearer(), Ok("fresh"));
    assert!(mailbox.token().has_refresh_token());
    assert!(mailbox.token().expires_at_ms > now_ms());
    assert_eq!(mailbox.messages().len(), 45);
    refresh.assert_async().await;
    p2.assert_async().await;
}
