use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{list_page, next_batch_size, SyncCursor, SyncPolicy};
use crate::errors::{AppError, AppResult};
use crate::gmail::GmailClient;
use crate::oauth::{TokenManager, TokenRecord};
use crate::types::MessageSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchState {
    Idle,
    Scheduled,
    Fetching,
}

/// What a background event did to the mailbox.
#[derive(Debug)]
pub enum PrefetchOutcome {
    Started,
    Appended(usize),
    Failed(AppError),
}

enum PrefetchEvent {
    Started {
        generation: u64,
    },
    /// Another fetch held the in-flight guard when the delay ran out.
    Skipped {
        generation: u64,
    },
    Finished {
        generation: u64,
        token: TokenRecord,
        result: AppResult<(Vec<MessageSummary>, SyncCursor)>,
    },
}

/// Sole owner of the message list, the cursor and the token. Background fetches
/// report over a channel and are applied in `next_event`.
pub struct Mailbox {
    client: GmailClient,
    tokens: TokenManager,
    policy: SyncPolicy,
    token: TokenRecord,
    cursor: SyncCursor,
    messages: Vec<MessageSummary>,
    loaded: bool,
    halted: bool,
    state: PrefetchState,
    in_flight: Arc<AtomicBool>,
    scheduled: Option<CancellationToken>,
    generation: u64,
    events_tx: mpsc::UnboundedSender<PrefetchEvent>,
    events_rx: mpsc::UnboundedReceiver<PrefetchEvent>,
}

impl Mailbox {
    pub fn new(
        client: GmailClient,
        tokens: TokenManager,
        policy: SyncPolicy,
        token: TokenRecord,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            client,
            tokens,
            cursor: SyncCursor::new(policy.max_total),
            policy,
            token,
            messages: Vec::new(),
            loaded: false,
            halted: false,
            state: PrefetchState::Idle,
            in_flight: Arc::new(AtomicBool::new(false)),
            scheduled: None,
            generation: 0,
            events_tx,
            events_rx,
        }
    }

    pub fn messages(&self) -> &[MessageSummary] {
        &self.messages
    }

    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    pub fn state(&self) -> PrefetchState {
        self.state
    }

    /// The current grant, possibly refreshed along the way. Callers persist it.
    pub fn token(&self) -> &TokenRecord {
        &self.token
    }

    /// Foreground load of the first page, then background continuation.
    /// Anything scheduled or running from an earlier load is orphaned.
    pub async fn load_initial(&mut self) -> AppResult<&[MessageSummary]> {
        self.cancel_scheduled();
        self.generation += 1;
        self.state = PrefetchState::Idle;

        let token = self.valid_token().await?;
        let start = SyncCursor::new(self.policy.max_total);
        let (page, cursor) = list_page(
            &self.client,
            &self.policy,
            &start,
            &token,
            self.policy.initial_batch_size,
        )
        .await?;

        info!(fetched = page.len(), has_next = cursor.next_page_token.is_some(), "Initial mailbox load");
        self.messages = page;
        self.cursor = cursor;
        self.loaded = true;
        self.halted = false;
        self.maybe_schedule();
        Ok(&self.messages)
    }

    /// Drop everything and start over from the first page.
    pub async fn refresh_all(&mut self) -> AppResult<&[MessageSummary]> {
        self.cursor = SyncCursor::new(self.policy.max_total);
        self.messages.clear();
        self.loaded = false;
        debug!("Mailbox reset");
        self.load_initial().await
    }

    /// User-initiated "load more". Returns the number of appended summaries.
    pub async fn load_more(&mut self) -> AppResult<usize> {
        if !self.loaded {
            self.load_initial().await?;
            return Ok(self.messages.len());
        }
        if self.in_flight.load(Ordering::Acquire) || !self.cursor.can_continue() {
            return Ok(0);
        }
        if self.state == PrefetchState::Scheduled {
            // The task may already be past its delay; orphan whatever it returns.
            self.cancel_scheduled();
            self.generation += 1;
            self.state = PrefetchState::Idle;
        }

        let token = self.valid_token().await?;
        let (page, cursor) = list_page(
            &self.client,
            &self.policy,
            &self.cursor,
            &token,
            self.policy.subsequent_batch_size,
        )
        .await?;

        let appended = page.len();
        self.messages.extend(page);
        self.cursor = cursor;
        self.halted = false;
        self.maybe_schedule();
        Ok(appended)
    }

    /// Wait for the next background event and apply it. `None` when nothing is
    /// scheduled or running.
    pub async fn next_event(&mut self) -> Option<PrefetchOutcome> {
        loop {
            let event = match self.events_rx.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => {
                    if self.state == PrefetchState::Idle && !self.in_flight.load(Ordering::Acquire)
                    {
                        return None;
                    }
                    self.events_rx.recv().await?
                }
                Err(TryRecvError::Disconnected) => return None,
            };
            if let Some(outcome) = self.apply(event) {
                return Some(outcome);
            }
        }
    }

    /// Run background prefetch until it stops. Returns the first failure, if any.
    pub async fn drain(&mut self) -> AppResult<()> {
        while let Some(outcome) = self.next_event().await {
            if let PrefetchOutcome::Failed(err) = outcome {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn valid_token(&mut self) -> AppResult<TokenRecord> {
        let token = self.tokens.get_valid_token(&self.token).await?;
        self.token = token.clone();
        token.bearer()?;
        Ok(token)
    }

    fn apply(&mut self, event: PrefetchEvent) -> Option<PrefetchOutcome> {
        match event {
            PrefetchEvent::Started { generation } => {
                if generation != self.generation {
                    return None;
                }
                self.scheduled = None;
                self.state = PrefetchState::Fetching;
                Some(PrefetchOutcome::Started)
            }
            PrefetchEvent::Skipped { generation } => {
                if generation == self.generation {
                    self.scheduled = None;
                    self.state = PrefetchState::Idle;
                    self.maybe_schedule();
                }
                None
            }
            PrefetchEvent::Finished {
                generation,
                token,
                result,
            } => {
                self.in_flight.store(false, Ordering::Release);
                if generation != self.generation {
                    debug!(generation, "Discarding stale background page");
                    self.maybe_schedule();
                    return None;
                }
                self.token = token;
                self.state = PrefetchState::Idle;

                match result {
                    Ok((page, cursor)) => {
                        let appended = page.len();
                        self.messages.extend(page);
                        self.cursor = cursor;
                        debug!(
                            appended,
                            total = self.cursor.total_fetched,
                            "Background page appended"
                        );
                        self.maybe_schedule();
                        Some(PrefetchOutcome::Appended(appended))
                    }
                    Err(err) => {
                        warn!(error = %err, "Background fetch failed; prefetch paused");
                        self.halted = true;
                        Some(PrefetchOutcome::Failed(err))
                    }
                }
            }
        }
    }

    /// `Idle -> Scheduled` when loaded, nothing in flight, more pages, room left.
    fn maybe_schedule(&mut self) -> bool {
        if !self.loaded
            || self.halted
            || self.state != PrefetchState::Idle
            || self.in_flight.load(Ordering::Acquire)
        {
            return false;
        }
        let Some(batch) = next_batch_size(&self.policy, &self.cursor) else {
            return false;
        };

        let cancel = CancellationToken::new();
        let task = BackgroundFetch {
            client: self.client.clone(),
            tokens: self.tokens.clone(),
            policy: self.policy.clone(),
            cursor: self.cursor.clone(),
            token: self.token.clone(),
            batch,
            generation: self.generation,
            in_flight: Arc::clone(&self.in_flight),
            events: self.events_tx.clone(),
        };
        tokio::spawn(task.run(cancel.clone()));

        debug!(batch, delay_ms = ?self.policy.prefetch_delay.as_millis(), "Background fetch scheduled");
        self.scheduled = Some(cancel);
        self.state = PrefetchState::Scheduled;
        true
    }

    fn cancel_scheduled(&mut self) {
        if let Some(cancel) = self.scheduled.take() {
            cancel.cancel();
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.cancel_scheduled();
    }
}

struct BackgroundFetch {
    client: GmailClient,
    tokens: TokenManager,
    policy: SyncPolicy,
    cursor: SyncCursor,
    token: TokenRecord,
    batch: usize,
    generation: u64,
    in_flight: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<PrefetchEvent>,
}

impl BackgroundFetch {
    async fn run(self, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(generation = self.generation, "Scheduled fetch cancelled");
                return;
            }
            _ = tokio::time::sleep(self.policy.prefetch_delay) => {}
        }

        if cancel.is_cancelled() {
            return;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let _ = self.events.send(PrefetchEvent::Skipped {
                generation: self.generation,
            });
            return;
        }

        let _ = self.events.send(PrefetchEvent::Started {
            generation: self.generation,
        });

        // The owner clears `in_flight` when it applies this event.
        let (token, result) = self.fetch().await;
        let _ = self.events.send(PrefetchEvent::Finished {
            generation: self.generation,
            token,
            result,
        });
    }

    async fn fetch(&self) -> (TokenRecord, AppResult<(Vec<MessageSummary>, SyncCursor)>) {
        let token = match self.tokens.get_valid_token(&self.token).await {
            Ok(token) => token,
            Err(err) => return (self.token.clone(), Err(err.into())),
        };
        if let Err(err) = token.bearer().map(|_| ()) {
            return (token, Err(err.into()));
        }

        let result = list_page(&self.client, &self.policy, &self.cursor, &token, self.batch).await;
        (token, result)
    }
}
