//! Turn reassembly for streamed AI replies.
//!
//! The backend streams a spoken reply as `audio` frames whose display text
//! arrives as segments, possibly out of order and possibly redelivered. The
//! aggregator folds each frame into the open AI message of the conversation
//! log and mints a playback task for every frame that actually carries audio.

use crate::conversation::{ConversationLog, MessageId, MessageStatus};
use crate::playback::AudioTask;
use lumi_protocol::DisplayText;
use tracing::debug;

/// What folding one inbound frame produced.
#[derive(Debug)]
pub struct AggregateOutcome {
    /// The AI message the frame was folded into.
    pub message_id: MessageId,
    /// Whether the message's content or audio changed.
    pub changed: bool,
    /// A playback task, present only when the frame carried audio.
    pub task: Option<AudioTask>,
}

/// Folds streamed reply frames into the conversation log.
#[derive(Default)]
pub struct ResponseAggregator {
    next_task_id: u64,
}

impl ResponseAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A complete non-segmented reply. Opens (or reuses) the AI turn, sets
    /// its content verbatim, and closes it.
    pub fn on_full_text(&mut self, log: &mut ConversationLog, text: &str) -> MessageId {
        let message = log.open_or_begin_turn();
        message.content = text.to_string();
        message.segments.clear();
        let id = message.id.clone();
        log.close_turn(MessageStatus::Received);
        id
    }

    /// One `audio` frame: folds its display text into the open turn and, when
    /// the frame carries a non-empty audio payload, records it and returns a
    /// playback task for it.
    pub fn on_audio(
        &mut self,
        log: &mut ConversationLog,
        audio: Option<&str>,
        display_text: Option<&DisplayText>,
    ) -> AggregateOutcome {
        let message = log.open_or_begin_turn();
        let mut changed = false;

        if let Some(dt) = display_text {
            changed |= message.apply_segment(&dt.text, dt.segment_order);
        }

        let mut task = None;
        if let Some(payload) = audio.filter(|a| !a.is_empty()) {
            // Last writer wins when several frames of one turn carry audio.
            message.audio = Some(payload.to_string());
            changed = true;
            let id = self.next_task_id;
            self.next_task_id += 1;
            task = Some(AudioTask {
                id,
                payload: payload.to_string(),
                text: display_text.map(|dt| dt.text.clone()),
            });
        } else {
            debug!("audio frame without payload folded as text only");
        }

        AggregateOutcome {
            message_id: message.id.clone(),
            changed,
            task,
        }
    }

    /// Ends the open turn, marking the message `status`. Used for both
    /// `conversation-chain-end` (Saved) and `force-new-message` (Received).
    pub fn finalize(
        &mut self,
        log: &mut ConversationLog,
        status: MessageStatus,
    ) -> Option<MessageId> {
        log.close_turn(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> ConversationLog {
        ConversationLog::new(1000)
    }

    #[test]
    fn full_text_is_a_closed_single_message() {
        let mut aggregator = ResponseAggregator::new();
        let mut log = log();

        let id = aggregator.on_full_text(&mut log, "complete answer");
        let message = log.get(&id).unwrap();
        assert_eq!(message.content, "complete answer");
        assert!(!message.is_streaming);
        assert_eq!(message.status, MessageStatus::Received);
    }

    #[test]
    fn audio_frames_accumulate_into_one_message() {
        let mut aggregator = ResponseAggregator::new();
        let mut log = log();

        let first = aggregator.on_audio(
            &mut log,
            None,
            Some(&DisplayText::new("Hello").with_order(0)),
        );
        let second = aggregator.on_audio(
            &mut log,
            Some("QUJD"),
            Some(&DisplayText::new(" world").with_order(1)),
        );

        assert_eq!(first.message_id, second.message_id);
        assert!(first.task.is_none());
        assert!(second.task.is_some());
        let message = log.get(&first.message_id).unwrap();
        assert_eq!(message.content, "Hello world");
        assert_eq!(message.audio.as_deref(), Some("QUJD"));
        assert!(message.is_streaming);
    }

    #[test]
    fn out_of_order_segments_reassemble() {
        let mut aggregator = ResponseAggregator::new();
        let mut log = log();

        for (text, order) in [("C", 2), ("A", 0), ("B", 1)] {
            aggregator.on_audio(&mut log, None, Some(&DisplayText::new(text).with_order(order)));
        }
        assert_eq!(log.messages()[0].content, "ABC");
    }

    #[test]
    fn redelivered_segment_changes_nothing() {
        let mut aggregator = ResponseAggregator::new();
        let mut log = log();

        let first =
            aggregator.on_audio(&mut log, None, Some(&DisplayText::new("Hi").with_order(0)));
        assert!(first.changed);
        let again =
            aggregator.on_audio(&mut log, None, Some(&DisplayText::new("Hi").with_order(0)));
        assert!(!again.changed);
        assert!(again.task.is_none());
        assert_eq!(log.messages()[0].content, "Hi");
    }

    #[test]
    fn only_audio_bearing_frames_mint_tasks() {
        let mut aggregator = ResponseAggregator::new();
        let mut log = log();

        let bare = aggregator.on_audio(&mut log, None, Some(&DisplayText::new("text only")));
        assert!(bare.task.is_none());

        let empty = aggregator.on_audio(&mut log, Some(""), None);
        assert!(empty.task.is_none());

        let with_audio = aggregator.on_audio(&mut log, Some("UENN"), None);
        let task = with_audio.task.unwrap();
        assert_eq!(task.payload, "UENN");
        assert_eq!(task.id, 0);

        let next = aggregator.on_audio(&mut log, Some("ZZZZ"), None);
        assert_eq!(next.task.unwrap().id, 1);
    }

    #[test]
    fn finalize_closes_and_marks_the_turn() {
        let mut aggregator = ResponseAggregator::new();
        let mut log = log();

        aggregator.on_audio(&mut log, None, Some(&DisplayText::new("done")));
        let id = aggregator.finalize(&mut log, MessageStatus::Saved).unwrap();
        let message = log.get(&id).unwrap();
        assert!(!message.is_streaming);
        assert_eq!(message.status, MessageStatus::Saved);

        assert!(aggregator.finalize(&mut log, MessageStatus::Saved).is_none());
    }

    #[test]
    fn frames_after_finalize_open_a_new_message() {
        let mut aggregator = ResponseAggregator::new();
        let mut log = log();

        let first = aggregator.on_audio(&mut log, None, Some(&DisplayText::new("one")));
        aggregator.finalize(&mut log, MessageStatus::Saved);
        let second = aggregator.on_audio(&mut log, None, Some(&DisplayText::new("two")));

        assert_ne!(first.message_id, second.message_id);
        assert_eq!(log.messages().len(), 2);
    }
}
