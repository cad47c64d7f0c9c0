//! The per-binding consumer task.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, Retryable};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{BindingStatus, ConsumerHandle, Control, SourcingError, SourcingState, StatusError};
use crate::binding::BindingId;
use crate::bridge::{Delivery, ScopedConsumer};
use crate::config::SourcingConfig;
use crate::error::ErrorKind;
use crate::message::{
    Message, StoredMessage, ROLLUP_HEADER, SOURCE_HEADER, SOURCE_SEQUENCE_HEADER,
};
use crate::registry::{Stream, StreamEvent};
use crate::storage::{CursorStore, StorageError};
use crate::subject::Subject;
use crate::utils::retry::{cursor_backoff, sourcing_backoff};

use SourcingState::*;

type Result<T> = std::result::Result<T, SourcingError>;

pub(crate) struct SourcingConsumer {
    id: BindingId,
    upstream: ScopedConsumer,
    downstream: Arc<Stream>,
    cursors: Arc<dyn CursorStore>,
    config: SourcingConfig,
    control: watch::Receiver<Control>,
    status: watch::Sender<BindingStatus>,
    /// `<account>.<stream>` of the upstream.
    source: String,
    cursor: u64,
    loaded: bool,
    events: Option<broadcast::Receiver<StreamEvent>>,
    delays: ExponentialBackoff,
    backing_off: bool,
}

impl SourcingConsumer {
    /// Start a consumer task for one binding.
    pub(crate) fn spawn(
        id: BindingId,
        upstream: ScopedConsumer,
        downstream: Arc<Stream>,
        cursors: Arc<dyn CursorStore>,
        config: SourcingConfig,
    ) -> ConsumerHandle {
        let (control_tx, control_rx) = watch::channel(Control::Run);
        let (status_tx, status_rx) = watch::channel(BindingStatus::default());
        let source = format!(
            "{}.{}",
            upstream.upstream().account(),
            upstream.upstream().stream_name()
        );
        let span = info_span!(
            "sourcing",
            binding = %id,
            upstream = %source,
            downstream = %downstream.name()
        );

        let consumer = Self {
            id,
            upstream,
            downstream,
            cursors,
            delays: sourcing_backoff(&config).build(),
            config,
            control: control_rx,
            status: status_tx,
            source,
            cursor: 0,
            loaded: false,
            events: None,
            backing_off: false,
        };
        let task = tokio::spawn(consumer.run().instrument(span));

        ConsumerHandle {
            id,
            control: control_tx,
            status: status_rx,
            task,
        }
    }

    async fn run(mut self) {
        let mut state = Initializing;
        loop {
            if state != Stopped {
                if let Some(requested) = self.requested() {
                    state = requested;
                }
            }
            self.set_state(state);

            state = match state {
                Initializing => self.initialize().await,
                CatchingUp => self.catch_up().await,
                SteadyState => self.steady().await,
                Recovering => self.recover().await,
                Paused => self.paused().await,
                Stopped => break,
            };
        }

        let cursor = self.cursor;
        self.upstream.close().await;
        info!(cursor, "Sourcing finished");
    }

    /// Pending administrative request, if it changes what the consumer does.
    fn requested(&mut self) -> Option<SourcingState> {
        match *self.control.borrow_and_update() {
            Control::Run => None,
            Control::Pause => Some(Paused),
            Control::Stop => Some(Stopped),
        }
    }

    fn set_state(&self, state: SourcingState) {
        let mut changed = false;
        self.status.send_modify(|status| {
            changed = status.state != state;
            status.state = state;
        });
        if changed {
            debug!(state = %state, cursor = self.cursor, "Sourcing state changed");
        }
    }

    fn record_error(&self, error: &SourcingError) {
        self.status
            .send_modify(|status| status.last_error = Some(StatusError::from(error)));
    }

    /// Route a failure: unreachable upstreams and full or failing stores are
    /// retried, everything else stops the binding.
    fn fail(&mut self, error: SourcingError) -> SourcingState {
        self.record_error(&error);
        match error.kind() {
            ErrorKind::TransientUpstreamUnavailable | ErrorKind::LimitExceeded | ErrorKind::Storage => {
                warn!(cursor = self.cursor, error = %error, "Sourcing interrupted, recovering");
                Recovering
            }
            _ => {
                error!(cursor = self.cursor, error = %error, "Sourcing stopped");
                Stopped
            }
        }
    }

    async fn initialize(&mut self) -> SourcingState {
        let cursors = self.cursors.clone();
        let key = self.id.cursor_key();
        let loaded = (|| {
            let cursors = cursors.clone();
            let key = key.clone();
            async move { cursors.get(&key).await }
        })
        .retry(cursor_backoff())
        .notify(|err: &StorageError, dur: Duration| {
            warn!(error = %err, delay = ?dur, "Cursor load failed, retrying");
        })
        .await;

        let mut cursor = match loaded {
            Ok(cursor) => cursor.unwrap_or(0),
            Err(e) => return self.fail(e.into()),
        };

        // A cursor beyond the upstream's last sequence belongs to an earlier
        // incarnation of the upstream stream.
        if cursor > 0 {
            let last_seq = match self.upstream.upstream().info().await {
                Ok(info) => info.state.last_seq,
                Err(e) => return self.fail(e.into()),
            };
            if cursor > last_seq {
                warn!(cursor, last_seq, "Stored cursor is ahead of the upstream, restarting from the beginning");
                cursor = 0;
                self.cursor = 0;
                self.commit().await;
            }
        }

        self.cursor = cursor;
        self.loaded = true;
        self.status.send_modify(|status| status.cursor = cursor);
        if cursor > 0 {
            self.ack(cursor).await;
        }
        info!(cursor, "Sourcing consumer initialized");
        CatchingUp
    }

    async fn catch_up(&mut self) -> SourcingState {
        // Subscribe before fetching so appends racing the last fetch are seen.
        if self.events.is_none() {
            match self.upstream.subscribe() {
                Ok(events) => self.events = Some(events),
                Err(e) => return self.fail(e.into()),
            }
        }

        loop {
            if let Some(requested) = self.requested() {
                return requested;
            }

            let fetched = match self.upstream.fetch(self.cursor, self.config.batch_size).await {
                Ok(fetched) => fetched,
                Err(e) => return self.fail(e.into()),
            };

            if fetched.last_seq < self.cursor {
                warn!(cursor = self.cursor, last_seq = fetched.last_seq, "Upstream sequence went backwards, restarting from the beginning");
                self.cursor = 0;
                self.status.send_modify(|status| status.cursor = 0);
                self.commit().await;
                continue;
            }

            if fetched.items.is_empty() {
                if fetched.last_seq > self.cursor {
                    self.report_missing(self.cursor + 1, fetched.last_seq);
                    self.pass(fetched.last_seq).await;
                    continue;
                }
                self.recovered();
                return SteadyState;
            }

            if let Err(e) = self.apply_batch(fetched.items).await {
                return self.fail(e);
            }
            self.recovered();
        }
    }

    async fn steady(&mut self) -> SourcingState {
        let Some(mut events) = self.events.take() else {
            return CatchingUp;
        };

        let next = loop {
            tokio::select! {
                changed = self.control.changed() => {
                    if changed.is_err() {
                        break Stopped;
                    }
                    if let Some(requested) = self.requested() {
                        break requested;
                    }
                }
                event = events.recv() => match event {
                    Ok(StreamEvent::Appended(sequence)) if sequence <= self.cursor => {}
                    Ok(StreamEvent::Appended(sequence)) if sequence == self.cursor + 1 => {
                        match self.pull_next().await {
                            Ok(true) => {}
                            Ok(false) => break CatchingUp,
                            Err(e) => break self.fail(e),
                        }
                    }
                    Ok(StreamEvent::Appended(sequence)) => {
                        debug!(cursor = self.cursor, notified = sequence, "Gap in live notifications");
                        break CatchingUp;
                    }
                    Ok(StreamEvent::Purged) => break CatchingUp,
                    Ok(StreamEvent::Deleted) | Err(RecvError::Closed) => {
                        break self.fail(SourcingError::UpstreamDeleted(self.source.clone()));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Live notifications lagged");
                        break CatchingUp;
                    }
                },
            }
        };

        self.events = Some(events);
        next
    }

    async fn recover(&mut self) -> SourcingState {
        self.backing_off = true;
        let delay = self.delays.next().unwrap_or(self.config.max_backoff());

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = self.control.changed() => {
                if changed.is_err() {
                    return Stopped;
                }
                if let Some(requested) = self.requested() {
                    return requested;
                }
            }
        }

        if !self.loaded {
            return Initializing;
        }
        match self.upstream.probe().await {
            Ok(()) => {
                debug!(cursor = self.cursor, "Upstream reachable");
                CatchingUp
            }
            Err(e) => self.fail(e.into()),
        }
    }

    async fn paused(&mut self) -> SourcingState {
        info!(cursor = self.cursor, "Sourcing paused");
        loop {
            match *self.control.borrow_and_update() {
                Control::Run => {
                    info!(cursor = self.cursor, "Sourcing resumed");
                    return CatchingUp;
                }
                Control::Stop => return Stopped,
                Control::Pause => {}
            }
            if self.control.changed().await.is_err() {
                return Stopped;
            }
        }
    }

    /// Progress was made; the next outage starts from the shortest delay.
    fn recovered(&mut self) {
        if self.backing_off {
            self.backing_off = false;
            self.delays = sourcing_backoff(&self.config).build();
            info!(cursor = self.cursor, "Sourcing recovered");
        }
    }

    /// Apply the message right after the cursor. `false` if it is already gone.
    async fn pull_next(&mut self) -> Result<bool> {
        let fetched = self.upstream.fetch(self.cursor, 1).await?;
        if fetched.items.is_empty() {
            return Ok(false);
        }
        self.apply_batch(fetched.items).await?;
        self.recovered();
        Ok(true)
    }

    async fn apply_batch(&mut self, items: Vec<Delivery>) -> Result<()> {
        let mut skipped_tail = false;
        for item in items {
            let sequence = item.sequence();
            if sequence > self.cursor + 1 {
                self.report_missing(self.cursor + 1, sequence - 1);
            }
            match item {
                Delivery::Filtered(_) => {
                    self.cursor = sequence;
                    self.status.send_modify(|status| {
                        status.skipped += 1;
                        status.cursor = sequence;
                    });
                    skipped_tail = true;
                }
                Delivery::Message(message) => {
                    self.apply(message).await?;
                    skipped_tail = false;
                }
            }
        }
        if skipped_tail {
            self.commit().await;
            self.ack(self.cursor).await;
        }
        Ok(())
    }

    async fn apply(&mut self, message: StoredMessage) -> Result<()> {
        let sequence = message.sequence;
        let subject = self.ingest_subject(&message.subject)?;

        let mut headers = message.headers;
        headers.remove(ROLLUP_HEADER);
        headers.insert(SOURCE_HEADER, self.source.as_str());
        headers.insert(SOURCE_SEQUENCE_HEADER, sequence.to_string());

        let ack = self
            .downstream
            .append_sourced(Message::new(subject, message.payload).with_headers(headers))
            .await?;

        self.cursor = sequence;
        self.status.send_modify(|status| {
            status.applied += 1;
            status.cursor = sequence;
        });
        debug!(
            upstream_seq = sequence,
            downstream_seq = ack.sequence,
            duplicate = ack.duplicate,
            "Message sourced"
        );

        self.commit().await;
        self.ack(sequence).await;
        Ok(())
    }

    /// Original subject of a delivered message.
    fn ingest_subject(&self, delivered: &str) -> Result<Subject> {
        let subject = Subject::new(delivered)?;
        match self.upstream.deliver() {
            None => Ok(subject),
            Some(deliver) => subject
                .strip_prefix(deliver)
                .ok_or_else(|| SourcingError::DeliverPrefix {
                    subject: delivered.to_string(),
                    deliver: deliver.to_string(),
                }),
        }
    }

    /// Move the cursor over sequences with nothing to apply.
    async fn pass(&mut self, sequence: u64) {
        self.cursor = sequence;
        self.status.send_modify(|status| status.cursor = sequence);
        self.commit().await;
        self.ack(sequence).await;
    }

    fn report_missing(&self, from: u64, to: u64) {
        let error = SourcingError::MissingUpstream {
            upstream: self.source.clone(),
            from,
            to,
        };
        warn!(from, to, "Upstream messages removed before they were sourced");
        self.status.send_modify(|status| status.missed += to - from + 1);
        self.record_error(&error);
    }

    /// Persist the cursor.
    ///
    /// A failed write is logged and recorded; the consumer keeps going, and
    /// a restart before the next successful write re-applies from the older
    /// cursor.
    async fn commit(&self) {
        if let Err(e) = self.cursors.put(&self.id.cursor_key(), self.cursor).await {
            warn!(cursor = self.cursor, error = %e, "Cursor persist failed");
            self.record_error(&SourcingError::from(e));
        }
    }

    async fn ack(&self, sequence: u64) {
        if let Err(e) = self.upstream.ack(sequence).await {
            debug!(sequence, error = %e, "Upstream ack deferred");
        }
    }
}
