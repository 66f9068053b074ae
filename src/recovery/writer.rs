//! Write-behind persistence task
//!
//! The session worker never waits on the disk. It sends directives to
//! this task, which owns every recovery write for the process: bursts of
//! `Persist` coalesce down to the newest image, `Clear` is executed in
//! order and acknowledged, and a failed write flips the shared dirty flag
//! and is retried on the next directive or on a timer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::store::{RecoverySnapshot, RecoveryStore};
use crate::session::{SessionId, UserId};

#[derive(Debug)]
pub(crate) enum RecoveryDirective {
    Persist(Box<RecoverySnapshot>),
    Clear {
        user_id: UserId,
        session_id: SessionId,
        ack: oneshot::Sender<()>,
    },
}

/// Cheap handle the session worker keeps.
#[derive(Clone)]
pub(crate) struct RecoveryHandle {
    tx: mpsc::UnboundedSender<RecoveryDirective>,
    dirty: Arc<AtomicBool>,
}

impl RecoveryHandle {
    /// Queue the latest snapshot; never blocks the caller.
    pub(crate) fn persist(&self, snapshot: RecoverySnapshot) {
        let _ = self.tx.send(RecoveryDirective::Persist(Box::new(snapshot)));
    }

    /// Remove the session's snapshot and wait until the removal is on
    /// disk. FIFO ordering makes the clear land after all queued writes.
    pub(crate) async fn clear(&self, user_id: UserId, session_id: SessionId) {
        let (ack, done) = oneshot::channel();
        if self
            .tx
            .send(RecoveryDirective::Clear {
                user_id,
                session_id,
                ack,
            })
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// True while the latest snapshot has not reached disk.
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }
}

pub(crate) struct RecoveryWriter {
    store: RecoveryStore,
    directives: mpsc::UnboundedReceiver<RecoveryDirective>,
    dirty: Arc<AtomicBool>,
    pending: Option<Box<RecoverySnapshot>>,
}

impl RecoveryWriter {
    pub(crate) fn spawn(store: RecoveryStore) -> (RecoveryHandle, JoinHandle<()>) {
        let (tx, directives) = mpsc::unbounded_channel();
        let dirty = Arc::new(AtomicBool::new(false));
        let writer = Self {
            store,
            directives,
            dirty: dirty.clone(),
            pending: None,
        };
        let handle = RecoveryHandle { tx, dirty };
        (handle, tokio::spawn(writer.run()))
    }

    async fn run(mut self) {
        let mut retry =
            tokio::time::interval(Duration::from_millis(self.store.config().retry_interval_ms));
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                directive = self.directives.recv() => {
                    let Some(first) = directive else { break };
                    self.drain(first).await;
                    if self.pending.is_some() {
                        retry.reset();
                    }
                }
                _ = retry.tick(), if self.pending.is_some() => {
                    if let Some(snapshot) = self.pending.take() {
                        self.persist(*snapshot).await;
                    }
                }
            }
        }
        // Channel closed: one last chance for a snapshot that never landed.
        if let Some(snapshot) = self.pending.take() {
            self.persist(*snapshot).await;
        }
        debug!("recovery writer stopped");
    }

    /// Pull everything queued and execute it, collapsing consecutive
    /// `Persist` runs to their newest snapshot. `Clear` never collapses.
    async fn drain(&mut self, first: RecoveryDirective) {
        let mut queue = VecDeque::from([first]);
        while let Ok(directive) = self.directives.try_recv() {
            queue.push_back(directive);
        }
        while let Some(directive) = queue.pop_front() {
            match directive {
                RecoveryDirective::Persist(mut latest) => {
                    while matches!(queue.front(), Some(RecoveryDirective::Persist(_))) {
                        if let Some(RecoveryDirective::Persist(newer)) = queue.pop_front() {
                            latest = newer;
                        }
                    }
                    self.persist(*latest).await;
                }
                RecoveryDirective::Clear {
                    user_id,
                    session_id,
                    ack,
                } => {
                    self.clear(user_id, session_id).await;
                    let _ = ack.send(());
                }
            }
        }
    }

    async fn persist(&mut self, snapshot: RecoverySnapshot) {
        match self.store.persist(&snapshot).await {
            Ok(()) => {
                self.dirty.store(false, Ordering::Relaxed);
                self.pending = None;
            }
            Err(error) => {
                warn!(
                    session_id = %snapshot.session_id,
                    %error,
                    "recovery persist failed, snapshot marked dirty"
                );
                self.dirty.store(true, Ordering::Relaxed);
                self.pending = Some(Box::new(snapshot));
            }
        }
    }

    async fn clear(&mut self, user_id: UserId, session_id: SessionId) {
        // The user's session is over either way; a dirty snapshot of it is moot.
        if self.pending.as_ref().is_some_and(|p| p.user_id == user_id) {
            self.pending = None;
            self.dirty.store(false, Ordering::Relaxed);
        }
        if let Err(error) = self.store.clear(user_id, session_id).await {
            warn!(%user_id, %error, "failed to clear recovery snapshot");
        }
    }
}
