//! Reordering buffer: holds messages briefly and emits them in
//! corrected-timestamp order, plus an optional vector-clock causal path.

use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::cmp::{Ordering, Reverse};

use log::{debug, warn};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BUFFER_TIMEOUT: f64 = 5.0;
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1000;
pub const DELIVERED_RETENTION: f64 = 3600.0;

/// A message with the timing fields the buffer orders by.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimedMessage {
    pub msg_id: String,
    pub sender: String,
    pub recipient: String,
    pub payload: String,
    pub original_ts: f64,
    pub corrected_ts: f64,
    pub receive_ts: f64,
    pub seq: Option<u64>,
    pub vector_clock: Option<BTreeMap<String, u64>>,
}

struct Buffered {
    key: OrderedFloat<f64>,
    arrival: u64,
    message: TimedMessage,
}

impl PartialEq for Buffered {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.arrival == other.arrival
    }
}

impl Eq for Buffered {}

impl PartialOrd for Buffered {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Buffered {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then(self.arrival.cmp(&other.arrival))
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BufferStatus {
    pub buffer_size: usize,
    pub max_buffer_size: usize,
    pub buffer_utilization: f64,
    pub average_message_age: f64,
    pub max_message_age: f64,
    pub messages_buffered: u64,
    pub messages_reordered: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub reorder_rate: f64,
    pub delivered_tracking_size: usize,
}

/// Min-heap on `corrected_ts` with a bounded capacity and a per-message
/// hold timeout.
///
/// Delivery policy: a popped message is released either once it has aged
/// past the hold timeout, or once no earlier message can still be expected
/// (nothing smaller remains buffered) and half the timeout has elapsed.
/// Anything else goes back into the heap.
pub struct MessageOrderingBuffer {
    buffer_timeout: f64,
    max_size: usize,

    heap: BinaryHeap<Reverse<Buffered>>,
    arrivals: u64,

    delivered: HashMap<String, f64>,

    messages_buffered: u64,
    messages_reordered: u64,
    messages_delivered: u64,
    messages_dropped: u64,
}

impl Default for MessageOrderingBuffer {
    fn default() -> Self {
        MessageOrderingBuffer::new(DEFAULT_BUFFER_TIMEOUT, DEFAULT_MAX_BUFFER_SIZE)
    }
}

impl MessageOrderingBuffer {
    pub fn new(buffer_timeout: f64, max_size: usize) -> Self {
        MessageOrderingBuffer {
            buffer_timeout,
            max_size,
            heap: BinaryHeap::new(),
            arrivals: 0,
            delivered: HashMap::new(),
            messages_buffered: 0,
            messages_reordered: 0,
            messages_delivered: 0,
            messages_dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.messages_dropped
    }

    /// Buffer a message. Messages already delivered within the retention
    /// horizon are rejected as duplicates.
    pub fn add_message(&mut self, message: TimedMessage) -> bool {
        if self.delivered.contains_key(&message.msg_id) {
            debug!("duplicate message ignored: {}", message.msg_id);
            return false;
        }
        if self.heap.len() >= self.max_size {
            self.drop_oldest();
        }
        self.arrivals += 1;
        self.heap.push(Reverse(Buffered {
            key: OrderedFloat(message.corrected_ts),
            arrival: self.arrivals,
            message,
        }));
        self.messages_buffered += 1;
        true
    }

    /// Release every message whose ordering constraints are satisfied at
    /// `now`, in corrected-timestamp order.
    pub fn get_deliverable(&mut self, now: f64) -> Vec<TimedMessage> {
        let mut deliverable: Vec<TimedMessage> = Vec::new();
        let mut retained: Vec<Buffered> = Vec::new();

        while let Some(Reverse(entry)) = self.heap.pop() {
            let age = now - entry.message.receive_ts;
            let held_too_long = age >= self.buffer_timeout;
            // the heap pops in timestamp order, so nothing earlier can
            // still arrive unless something earlier was just retained
            let nothing_earlier_expected = retained.is_empty();
            let grace_elapsed = age >= self.buffer_timeout * 0.5;

            if held_too_long || (nothing_earlier_expected && grace_elapsed) {
                if age > self.buffer_timeout * 2.0 {
                    warn!(
                        "message {} delivered after long delay: {:.2}s",
                        entry.message.msg_id, age
                    );
                }
                deliverable.push(entry.message);
            } else {
                retained.push(entry);
            }
        }

        for entry in retained {
            self.heap.push(Reverse(entry));
        }

        // count deliveries that had overtaken an earlier timestamp
        for pair in deliverable.windows(2) {
            if pair[1].corrected_ts < pair[0].corrected_ts {
                self.messages_reordered += 1;
            }
        }
        deliverable.sort_by(|a, b| {
            OrderedFloat(a.corrected_ts).cmp(&OrderedFloat(b.corrected_ts))
        });

        for message in &deliverable {
            self.delivered.insert(message.msg_id.clone(), now);
        }
        self.messages_delivered += deliverable.len() as u64;
        self.trim_delivered(now);

        deliverable
    }

    /// Drain the buffer unconditionally, in corrected-timestamp order.
    pub fn force_deliver_all(&mut self, now: f64) -> Vec<TimedMessage> {
        let mut messages: Vec<TimedMessage> = self
            .heap
            .drain()
            .map(|Reverse(entry)| entry.message)
            .collect();
        messages.sort_by(|a, b| OrderedFloat(a.corrected_ts).cmp(&OrderedFloat(b.corrected_ts)));
        for message in &messages {
            self.delivered.insert(message.msg_id.clone(), now);
        }
        self.messages_delivered += messages.len() as u64;
        messages
    }

    /// Shed the oldest tenth of the buffer (by receive time) when full.
    fn drop_oldest(&mut self) {
        let mut entries: Vec<Buffered> = self.heap.drain().map(|Reverse(e)| e).collect();
        entries.sort_by(|a, b| {
            OrderedFloat(a.message.receive_ts).cmp(&OrderedFloat(b.message.receive_ts))
        });
        let to_drop = (entries.len() / 10).max(1);
        for dropped in entries.drain(..to_drop.min(entries.len())) {
            warn!("buffer full, dropped old message: {}", dropped.message.msg_id);
            self.messages_dropped += 1;
        }
        for entry in entries {
            self.heap.push(Reverse(entry));
        }
    }

    fn trim_delivered(&mut self, now: f64) {
        let cutoff = now - DELIVERED_RETENTION;
        self.delivered.retain(|_, delivered_at| *delivered_at >= cutoff);
    }

    pub fn status(&self, now: f64) -> BufferStatus {
        let ages: Vec<f64> = self
            .heap
            .iter()
            .map(|Reverse(entry)| now - entry.message.receive_ts)
            .collect();
        let (average_age, max_age) = if ages.is_empty() {
            (0.0, 0.0)
        } else {
            (
                ages.iter().sum::<f64>() / ages.len() as f64,
                ages.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            )
        };
        BufferStatus {
            buffer_size: self.heap.len(),
            max_buffer_size: self.max_size,
            buffer_utilization: self.heap.len() as f64 / self.max_size as f64,
            average_message_age: average_age,
            max_message_age: max_age,
            messages_buffered: self.messages_buffered,
            messages_reordered: self.messages_reordered,
            messages_delivered: self.messages_delivered,
            messages_dropped: self.messages_dropped,
            reorder_rate: self.messages_reordered as f64 / self.messages_delivered.max(1) as f64,
            delivered_tracking_size: self.delivered.len(),
        }
    }
}

/// Vector-clock gating: a message is deliverable when it is the immediate
/// next event from its sender and does not depend on anything the local
/// view has not seen.
pub struct CausalOrderingManager {
    node_id: String,
    vector_clock: BTreeMap<String, u64>,
    pending: HashMap<String, Vec<TimedMessage>>,
}

impl CausalOrderingManager {
    pub fn new(node_id: impl Into<String>) -> Self {
        CausalOrderingManager {
            node_id: node_id.into(),
            vector_clock: BTreeMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn clock(&self) -> &BTreeMap<String, u64> {
        &self.vector_clock
    }

    pub fn pending_len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Stamp an outgoing message: bump the local component.
    pub fn increment_clock(&mut self) -> BTreeMap<String, u64> {
        *self.vector_clock.entry(self.node_id.clone()).or_insert(0) += 1;
        self.vector_clock.clone()
    }

    fn update_clock(&mut self, sender_clock: &BTreeMap<String, u64>) {
        for (node, value) in sender_clock {
            if node != &self.node_id {
                let entry = self.vector_clock.entry(node.clone()).or_insert(0);
                *entry = (*entry).max(*value);
            }
        }
        *self.vector_clock.entry(self.node_id.clone()).or_insert(0) += 1;
    }

    pub fn can_deliver(&self, message: &TimedMessage) -> bool {
        let clock = match &message.vector_clock {
            Some(clock) => clock,
            None => return true,
        };
        for (node, value) in clock {
            let seen = self.vector_clock.get(node).copied().unwrap_or(0);
            if node == &message.sender {
                if *value != seen + 1 {
                    return false;
                }
            } else if *value > seen {
                return false;
            }
        }
        true
    }

    pub fn add_pending(&mut self, message: TimedMessage) {
        self.pending
            .entry(message.sender.clone())
            .or_default()
            .push(message);
    }

    /// Every pending message whose causal dependencies are satisfied, in
    /// corrected-timestamp order. Delivery advances the local view, so one
    /// call can release a chain.
    pub fn take_deliverable(&mut self) -> Vec<TimedMessage> {
        let mut deliverable = Vec::new();
        loop {
            let mut progressed = false;
            for sender in self.pending.keys().cloned().collect::<Vec<_>>() {
                let Some(messages) = self.pending.remove(&sender) else {
                    continue;
                };
                let mut still_pending = Vec::new();
                for message in messages {
                    if self.can_deliver(&message) {
                        if let Some(clock) = message.vector_clock.clone() {
                            self.update_clock(&clock);
                        }
                        deliverable.push(message);
                        progressed = true;
                    } else {
                        still_pending.push(message);
                    }
                }
                if !still_pending.is_empty() {
                    self.pending.insert(sender, still_pending);
                }
            }
            if !progressed {
                break;
            }
        }
        deliverable.sort_by(|a, b| OrderedFloat(a.corrected_ts).cmp(&OrderedFloat(b.corrected_ts)));
        deliverable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(msg_id: &str, corrected: f64, received: f64) -> TimedMessage {
        TimedMessage {
            msg_id: msg_id.to_owned(),
            sender: "sensor".to_owned(),
            recipient: "client".to_owned(),
            payload: "data".to_owned(),
            original_ts: corrected,
            corrected_ts: corrected,
            receive_ts: received,
            seq: None,
            vector_clock: None,
        }
    }

    #[test]
    fn out_of_order_messages_come_back_in_timestamp_order() {
        let mut buffer = MessageOrderingBuffer::new(0.1, 1000);
        let now = 1000.0;
        assert!(buffer.add_message(message("a", now + 2.0, now)));
        assert!(buffer.add_message(message("b", now + 1.0, now)));

        let delivered = buffer.get_deliverable(now + 1.0);
        let ids: Vec<&str> = delivered.iter().map(|m| m.msg_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn delivered_ids_suppress_duplicates() {
        let mut buffer = MessageOrderingBuffer::default();
        let now = 1000.0;
        assert!(buffer.add_message(message("dup", now, now)));
        let delivered = buffer.get_deliverable(now + 10.0);
        assert_eq!(delivered.len(), 1);
        assert!(!buffer.add_message(message("dup", now, now)));
    }

    #[test]
    fn young_messages_are_held_for_reordering() {
        let mut buffer = MessageOrderingBuffer::new(4.0, 1000);
        let now = 1000.0;
        buffer.add_message(message("young", now, now));
        // age 1s: below both the timeout and the grace period
        assert!(buffer.get_deliverable(now + 1.0).is_empty());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn grace_period_releases_the_frontier_message() {
        let mut buffer = MessageOrderingBuffer::new(4.0, 1000);
        let now = 1000.0;
        buffer.add_message(message("front", now, now));
        // age 2.1s: half the timeout has passed and nothing earlier exists
        let delivered = buffer.get_deliverable(now + 2.1);
        assert_eq!(delivered.len(), 1);
    }

    #[test]
    fn retained_earlier_message_blocks_the_grace_path() {
        let mut buffer = MessageOrderingBuffer::new(4.0, 1000);
        let now = 1000.0;
        // earlier timestamp but arrived late: too young to release
        buffer.add_message(message("early", now + 1.0, now + 2.0));
        // later timestamp, old enough for the grace period
        buffer.add_message(message("late", now + 5.0, now));

        let delivered = buffer.get_deliverable(now + 3.0);
        assert!(delivered.is_empty());
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn overflow_drops_the_oldest_tenth() {
        let mut buffer = MessageOrderingBuffer::new(5.0, 20);
        let now = 1000.0;
        for n in 0..20 {
            let id = format!("m{}", n);
            buffer.add_message(message(&id, now + n as f64, now + n as f64));
        }
        assert_eq!(buffer.len(), 20);
        buffer.add_message(message("overflow", now + 50.0, now + 50.0));
        // 10% of 20 = 2 dropped, then one added
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.len(), 19);

        // heap order is preserved: a full drain comes out sorted
        let drained = buffer.force_deliver_all(now + 100.0);
        let mut sorted = drained.clone();
        sorted.sort_by(|a, b| OrderedFloat(a.corrected_ts).cmp(&OrderedFloat(b.corrected_ts)));
        assert_eq!(drained, sorted);
        // the two oldest-received messages are the ones gone
        assert!(!drained.iter().any(|m| m.msg_id == "m0" || m.msg_id == "m1"));
    }

    #[test]
    fn force_delivery_empties_the_buffer_in_order() {
        let mut buffer = MessageOrderingBuffer::default();
        let now = 1000.0;
        buffer.add_message(message("b", now + 2.0, now));
        buffer.add_message(message("a", now + 1.0, now));
        let drained = buffer.force_deliver_all(now);
        assert_eq!(
            drained.iter().map(|m| m.msg_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert!(buffer.is_empty());
        // forced deliveries still count for duplicate suppression
        assert!(!buffer.add_message(message("a", now + 1.0, now)));
    }

    #[test]
    fn status_reports_utilization_and_counters() {
        let mut buffer = MessageOrderingBuffer::new(5.0, 10);
        let now = 1000.0;
        buffer.add_message(message("a", now, now - 2.0));
        let status = buffer.status(now);
        assert_eq!(status.buffer_size, 1);
        assert!((status.buffer_utilization - 0.1).abs() < 1e-9);
        assert!((status.average_message_age - 2.0).abs() < 1e-9);
        assert_eq!(status.messages_buffered, 1);
    }

    fn causal_message(
        msg_id: &str,
        sender: &str,
        corrected: f64,
        clock: &[(&str, u64)],
    ) -> TimedMessage {
        let mut message = message(msg_id, corrected, corrected);
        message.sender = sender.to_owned();
        message.vector_clock = Some(
            clock
                .iter()
                .map(|(node, value)| (node.to_string(), *value))
                .collect(),
        );
        message
    }

    #[test]
    fn causal_chain_delivers_in_sender_order() {
        let mut causal = CausalOrderingManager::new("local");
        // second event from "a" arrives first and must wait
        causal.add_pending(causal_message("second", "a", 2.0, &[("a", 2)]));
        assert!(causal.take_deliverable().is_empty());

        causal.add_pending(causal_message("first", "a", 1.0, &[("a", 1)]));
        let delivered = causal.take_deliverable();
        assert_eq!(
            delivered.iter().map(|m| m.msg_id.as_str()).collect::<Vec<_>>(),
            vec!["first", "second"]
        );
        assert_eq!(causal.pending_len(), 0);
    }

    #[test]
    fn dependency_on_unseen_node_blocks_delivery() {
        let mut causal = CausalOrderingManager::new("local");
        // depends on an event from "b" the local node has not seen
        causal.add_pending(causal_message("m", "a", 1.0, &[("a", 1), ("b", 3)]));
        assert!(causal.take_deliverable().is_empty());
        assert_eq!(causal.pending_len(), 1);
    }

    #[test]
    fn outgoing_messages_bump_the_local_clock() {
        let mut causal = CausalOrderingManager::new("local");
        let stamped = causal.increment_clock();
        assert_eq!(stamped.get("local"), Some(&1));
        assert_eq!(causal.increment_clock().get("local"), Some(&2));
    }

    #[test]
    fn messages_without_clocks_are_unconstrained() {
        let causal = CausalOrderingManager::new("local");
        assert!(causal.can_deliver(&message("plain", 1.0, 1.0)));
    }
}
