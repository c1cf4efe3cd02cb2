//! Event Queue
//!
//! Per-module buffer for notes whose time falls after the block currently
//! rendering. Storage is allocated once; a full queue drops the new note and
//! counts it rather than growing on the audio thread.

use crate::context::Frame;
use crate::note::NoteMessage;

/// Default number of pending notes per module
pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

/// Time-ordered pending notes for one module
#[derive(Debug)]
pub struct EventQueue {
    events: Vec<NoteMessage>,
    capacity: usize,
    dropped: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Whether `time` falls inside the block `[start, start + duration)`
    #[inline]
    pub fn is_time_within_frame(frame: &Frame, time: f64) -> bool {
        frame.contains(time)
    }

    /// Queue a note for a later block.
    ///
    /// Notes are kept sorted by time; equal times keep their arrival order.
    /// Returns false (and counts a drop) if the queue is full.
    pub fn queue_note(&mut self, note: NoteMessage) -> bool {
        if self.events.len() >= self.capacity {
            self.dropped += 1;
            tracing::warn!(
                pitch = note.pitch,
                time = note.time,
                "note queue full, dropping note"
            );
            return false;
        }
        let index = self.events.partition_point(|e| e.time <= note.time);
        self.events.insert(index, note);
        true
    }

    /// Release every queued note that is due before the end of `frame`.
    ///
    /// Notes are delivered in time order. A note that is already late is
    /// delivered at the block start, so delivered times always lie within
    /// the frame.
    pub fn process(&mut self, frame: &Frame, mut deliver: impl FnMut(NoteMessage)) {
        let due = self.events.partition_point(|e| e.time < frame.end());
        for mut note in self.events.drain(..due) {
            if note.time < frame.start {
                tracing::debug!(
                    pitch = note.pitch,
                    late_ms = frame.start - note.time,
                    "late note moved to block start"
                );
                note.time = frame.start;
            }
            deliver(note);
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Time of the next pending note
    pub fn next_time(&self) -> Option<f64> {
        self.events.first().map(|e| e.time)
    }

    /// Notes dropped since the last call
    pub fn take_dropped(&mut self) -> usize {
        std::mem::take(&mut self.dropped)
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EngineContext;

    fn released(queue: &mut EventQueue, frame: &Frame) -> Vec<NoteMessage> {
        let mut out = Vec::new();
        queue.process(frame, |n| out.push(n));
        out
    }

    #[test]
    fn test_note_delivered_on_containing_block_only() {
        let ctx = EngineContext::new(44100.0, 64);
        let mut queue = EventQueue::default();
        queue.queue_note(NoteMessage::on(3.0, 60, 100));

        let mut frame = ctx.frame_at(0.0);
        let mut delivered_on = Vec::new();
        for block in 0..8 {
            for note in released(&mut queue, &frame) {
                assert!(frame.contains(note.time));
                delivered_on.push(block);
            }
            frame = frame.next();
        }
        assert_eq!(delivered_on, vec![2]);
    }

    #[test]
    fn test_equal_times_keep_arrival_order() {
        let mut queue = EventQueue::new(8);
        queue.queue_note(NoteMessage::on(5.0, 60, 100));
        queue.queue_note(NoteMessage::on(2.0, 48, 100));
        queue.queue_note(NoteMessage::on(5.0, 62, 100));
        queue.queue_note(NoteMessage::on(5.0, 64, 100));

        let pitches: Vec<i32> = released(&mut queue, &Frame::new(0.0, 10.0))
            .iter()
            .map(|n| n.pitch)
            .collect();
        assert_eq!(pitches, vec![48, 60, 62, 64]);
    }

    #[test]
    fn test_later_notes_stay_queued() {
        let mut queue = EventQueue::new(8);
        queue.queue_note(NoteMessage::on(1.0, 60, 100));
        queue.queue_note(NoteMessage::on(20.0, 62, 100));

        assert_eq!(released(&mut queue, &Frame::new(0.0, 5.0)).len(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_time(), Some(20.0));
    }

    #[test]
    fn test_late_note_clamped_to_block_start() {
        let mut queue = EventQueue::new(8);
        queue.queue_note(NoteMessage::on(1.0, 60, 100));
        let notes = released(&mut queue, &Frame::new(4.0, 2.0));
        assert_eq!(notes[0].time, 4.0);
    }

    #[test]
    fn test_full_queue_drops() {
        let mut queue = EventQueue::new(2);
        assert!(queue.queue_note(NoteMessage::on(1.0, 60, 100)));
        assert!(queue.queue_note(NoteMessage::on(2.0, 61, 100)));
        assert!(!queue.queue_note(NoteMessage::on(3.0, 62, 100)));
        assert_eq!(queue.take_dropped(), 1);
        assert_eq!(queue.take_dropped(), 0);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_is_time_within_frame() {
        let frame = Frame::new(2.0, 1.0);
        assert!(EventQueue::is_time_within_frame(&frame, 2.0));
        assert!(!EventQueue::is_time_within_frame(&frame, 3.0));
    }
}
