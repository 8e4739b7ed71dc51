//! Ticket registry: owns the tracked-response table under a single mutex,
//! and the wakeup broadcast used by every waiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::record::{RequestRecord, Ticket};

/// A caller-supplied completion callback, invoked synchronously from the
/// thread/task that updates the record. Returns true to signal the
/// dispatcher it's fine to forget the record immediately.
pub type CompletionCallback = Arc<dyn Fn(&RequestRecord) -> bool + Send + Sync>;

pub struct TrackedEntry {
    pub submit_time: Instant,
    pub record: RequestRecord,
    pub callback: Option<CompletionCallback>,
}

/// Single authoritative table for post-submission ticket state.
#[derive(Default)]
pub struct TicketRegistry {
    table: Mutex<HashMap<Ticket, TrackedEntry>>,
    /// The shared `somethingReceived` condition: broadcast on any status
    /// change so every `wait()` re-checks its own filter.
    something_received: Notify,
    /// No new submissions are accepted once shutdown begins.
    accepting: std::sync::atomic::AtomicBool,
}

impl TicketRegistry {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            something_received: Notify::new(),
            accepting: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn stop_accepting(&self) {
        self.accepting
            .store(false, std::sync::atomic::Ordering::Release);
    }

    pub fn insert(&self, ticket: Ticket, submit_time: Instant, record: RequestRecord, callback: Option<CompletionCallback>) {
        self.table.lock().insert(
            ticket,
            TrackedEntry {
                submit_time,
                record,
                callback,
            },
        );
    }

    /// Applies `f` to the tracked record for `ticket`, if any. If a caller
    /// callback was registered it is invoked with the updated record
    /// if one was registered; the shared wakeup is always broadcast too,
    /// since `wait()` re-checks its predicate on every wakeup regardless
    /// of the path that produced it. Returns the callback's result so the
    /// caller can decide whether to forget the entry right away.
    pub fn update<F>(&self, ticket: Ticket, f: F) -> Option<bool>
    where
        F: FnOnce(&mut RequestRecord),
    {
        let (callback, record_snapshot) = {
            let mut table = self.table.lock();
            let entry = table.get_mut(&ticket)?;
            f(&mut entry.record);
            (entry.callback.clone(), entry.record.clone())
        };

        let callback_result = callback.map(|cb| cb(&record_snapshot));
        self.something_received.notify_waiters();
        Some(callback_result.unwrap_or(false))
    }

    pub fn remove(&self, ticket: Ticket) -> Option<RequestRecord> {
        self.table.lock().remove(&ticket).map(|e| e.record)
    }

    /// Read-only peek. Missing ticket -> synthesised `Dropped` record.
    pub fn enquire(&self, ticket: Ticket) -> RequestRecord {
        self.table
            .lock()
            .get(&ticket)
            .map(|e| e.record.clone())
            .unwrap_or_else(|| RequestRecord::synthesised_dropped(ticket))
    }

    /// Finds the first tracked ticket matching the wildcard rule.
    pub fn find_matching(&self, client_tx_id: &str, coord_tx_id: u64, shard_id: &str) -> Option<Ticket> {
        self.table
            .lock()
            .values()
            .find(|e| e.record.matches_filter(client_tx_id, coord_tx_id, shard_id))
            .map(|e| e.record.ticket)
    }

    /// Removes every matching record. Entries that are not yet terminal
    /// are marked `dropped` rather than removed: the transport task driving
    /// them is still going to call back into `update`, and letting that
    /// land on a live (if now-discarded) entry is simpler than trying to
    /// cancel an in-flight `reqwest` future. A terminal entry has nothing
    /// left to race with, so it's removed immediately.
    pub fn drop_matching(&self, client_tx_id: &str, coord_tx_id: u64, shard_id: &str) {
        let mut table = self.table.lock();
        let matching: Vec<Ticket> = table
            .values()
            .filter(|e| e.record.matches_filter(client_tx_id, coord_tx_id, shard_id))
            .map(|e| e.record.ticket)
            .collect();

        for ticket in matching {
            if let Some(entry) = table.get_mut(&ticket) {
                if entry.record.status.is_terminal() {
                    table.remove(&ticket);
                } else {
                    entry.record.dropped = true;
                }
            }
        }
        drop(table);
        self.something_received.notify_waiters();
    }

    /// Removes (or marks `dropped`) a single ticket, regardless of whether
    /// it matches any transaction filter. Used when the caller already
    /// knows the exact ticket.
    pub fn drop_ticket(&self, ticket: Ticket) {
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(&ticket) {
            if entry.record.status.is_terminal() {
                table.remove(&ticket);
            } else {
                entry.record.dropped = true;
            }
        }
        drop(table);
        self.something_received.notify_waiters();
    }

    /// Snapshot of the current record for `ticket`, if tracked.
    pub fn snapshot(&self, ticket: Ticket) -> Option<RequestRecord> {
        self.table.lock().get(&ticket).map(|e| e.record.clone())
    }

    pub fn notify_all(&self) {
        self.something_received.notify_waiters();
    }

    pub async fn notified(&self) {
        self.something_received.notified().await
    }

    /// Invoked by the background worker's timeout sweep: every `Sent`,
    /// `Sending`, or `Submitted` record whose deadline has elapsed
    /// transitions to `Timeout`.
    pub fn sweep_timeouts(&self) -> Vec<Ticket> {
        let now = Instant::now();
        let mut timed_out = Vec::new();
        let mut table = self.table.lock();
        for (ticket, entry) in table.iter_mut() {
            let overdue = entry
                .record
                .deadline
                .map(|d| now >= d)
                .unwrap_or(false);
            let was_sent = entry.record.status == crate::record::Status::Sent;
            let send_in_progress = matches!(
                entry.record.status,
                crate::record::Status::Submitted | crate::record::Status::Sending
            );
            if overdue && (was_sent || send_in_progress) {
                entry.record.status = crate::record::Status::Timeout;
                entry.record.send_was_complete = was_sent;
                timed_out.push(*ticket);
            }
        }
        drop(table);
        if !timed_out.is_empty() {
            self.something_received.notify_waiters();
        }
        timed_out
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Status, TransactionIds};
    use std::time::Duration;

    fn tracked(ticket: Ticket) -> RequestRecord {
        RequestRecord::new(ticket, TransactionIds::default(), None, true, Some(Duration::from_secs(5)))
    }

    #[test]
    fn enquire_unknown_ticket_synthesises_dropped() {
        let registry = TicketRegistry::new();
        let record = registry.enquire(Ticket(99));
        assert_eq!(record.status, Status::Dropped);
        assert!(record.dropped);
    }

    #[test]
    fn update_mutates_tracked_record_and_reports_callback_result() {
        let registry = TicketRegistry::new();
        let ticket = Ticket(1);
        registry.insert(ticket, std::time::Instant::now(), tracked(ticket), None);

        let result = registry.update(ticket, |record| record.status = Status::Received);
        assert_eq!(result, Some(false));
        assert_eq!(registry.snapshot(ticket).unwrap().status, Status::Received);
    }

    #[test]
    fn update_invokes_caller_callback_with_final_record() {
        let registry = TicketRegistry::new();
        let ticket = Ticket(1);
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let seen_for_cb = seen.clone();
        let callback: CompletionCallback = Arc::new(move |record| {
            *seen_for_cb.lock() = Some(record.status);
            true
        });
        registry.insert(ticket, std::time::Instant::now(), tracked(ticket), Some(callback));

        let result = registry.update(ticket, |record| record.status = Status::Error);
        assert_eq!(result, Some(true));
        assert_eq!(*seen.lock(), Some(Status::Error));
    }

    #[test]
    fn update_on_missing_ticket_is_a_safe_no_op() {
        let registry = TicketRegistry::new();
        assert_eq!(registry.update(Ticket(404), |record| record.status = Status::Error), None);
    }

    #[test]
    fn drop_matching_removes_terminal_and_flags_in_flight() {
        let registry = TicketRegistry::new();
        let terminal = Ticket(1);
        let mut terminal_record = tracked(terminal);
        terminal_record.status = Status::Received;
        registry.insert(terminal, std::time::Instant::now(), terminal_record, None);

        let in_flight = Ticket(2);
        registry.insert(in_flight, std::time::Instant::now(), tracked(in_flight), None);

        registry.drop_matching("", 0, "");

        assert!(registry.snapshot(terminal).is_none());
        let remaining = registry.snapshot(in_flight).unwrap();
        assert!(remaining.dropped);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn sweep_timeouts_only_touches_overdue_sent_or_submitted_entries() {
        let registry = TicketRegistry::new();
        let mut overdue = tracked(Ticket(1));
        overdue.deadline = Some(std::time::Instant::now() - Duration::from_millis(1));
        registry.insert(Ticket(1), std::time::Instant::now(), overdue, None);

        let fresh = tracked(Ticket(2));
        registry.insert(Ticket(2), std::time::Instant::now(), fresh, None);

        let swept = registry.sweep_timeouts();
        assert_eq!(swept, vec![Ticket(1)]);
        assert_eq!(registry.snapshot(Ticket(1)).unwrap().status, Status::Timeout);
        assert_eq!(registry.snapshot(Ticket(2)).unwrap().status, Status::Submitted);
    }

    #[test]
    fn stop_accepting_is_observable() {
        let registry = TicketRegistry::new();
        assert!(registry.is_accepting());
        registry.stop_accepting();
        assert!(!registry.is_accepting());
    }
}
