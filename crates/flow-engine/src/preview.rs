//! Continuous single-operator preview
//!
//! The pull model is authoritative; live preview is a thin reactive
//! wrapper for property panels: whenever any input field of the watched
//! operator changes (and the operator is not locked), it marks the
//! operator dirty, pulls it, and pushes the fresh outputs into the
//! output fields so chained consumers update immediately.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::field::{Field, SubscriberId};
use crate::graph::Graph;
use crate::OperatorId;

/// Reactive recompute loop for one operator
pub struct LivePreview {
    graph: Arc<Graph>,
    operator: OperatorId,
    subscriptions: Mutex<Vec<(Weak<Field>, SubscriberId)>>,
    changed: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LivePreview {
    pub fn new(graph: Arc<Graph>, operator: impl Into<OperatorId>) -> Arc<Self> {
        Arc::new(Self {
            graph,
            operator: operator.into(),
            subscriptions: Mutex::new(Vec::new()),
            changed: Arc::new(Notify::new()),
            task: Mutex::new(None),
        })
    }

    pub fn operator_id(&self) -> &str {
        &self.operator
    }

    /// Subscribe to the operator's input fields and start the recompute
    /// task. Notifications arriving during a recompute coalesce into
    /// one trailing run.
    pub fn start(self: &Arc<Self>) {
        let Some(operator) = self.graph.operator(&self.operator) else {
            log::warn!("live preview target '{}' not found", self.operator);
            return;
        };

        let mut subs = self.subscriptions.lock();
        if !subs.is_empty() {
            return;
        }
        for field in operator.input_fields() {
            let changed = Arc::clone(&self.changed);
            let token = field.subscribe(move |_| changed.notify_one());
            subs.push((Arc::downgrade(&field), token));
        }
        drop(subs);

        let preview = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                preview.changed.notified().await;
                preview.recompute().await;
            }
        });
        *self.task.lock() = Some(handle);
    }

    /// Stop the recompute task and drop the field subscriptions
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        for (weak, token) in self.subscriptions.lock().drain(..) {
            if let Some(field) = weak.upgrade() {
                field.unsubscribe(token);
            }
        }
    }

    async fn recompute(&self) {
        let Some(operator) = self.graph.operator(&self.operator) else { return };
        if operator.is_locked() {
            return;
        }
        self.graph
            .mark_dirty(std::slice::from_ref(&self.operator));
        match operator.pull(&self.graph).await {
            Ok(outputs) => {
                for (name, value) in outputs {
                    if let Some(field) = operator.output(&name) {
                        if let Err(err) = field.set_value(value) {
                            log::warn!(
                                "preview output '{}.{}' rejected: {}",
                                self.operator,
                                name,
                                err
                            );
                        }
                    }
                }
            }
            Err(err) => {
                log::warn!("preview recompute of '{}' failed: {}", self.operator, err);
            }
        }
    }
}

impl Drop for LivePreview {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
