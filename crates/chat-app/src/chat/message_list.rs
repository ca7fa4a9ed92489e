use std::cell::RefCell;
use std::rc::Rc;

use snafu::{Snafu, ensure};

use crate::chat::message::{ChatMessage, MessageContent, Position, Sender};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("message index {index} is out of range on `{stage}` (len {len})"))]
    IndexOutOfRange {
        stage: &'static str,
        index: usize,
        len: usize,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Granularity of a content mutation, used to pick a follow threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Text,
    Annotation,
}

impl ChangeKind {
    /// Classifies a message as it is appended. Streamed body or reasoning text is fine
    /// grained; system notices and messages that open with a note or tool notice are not.
    pub fn of_appended(message: &ChatMessage) -> Self {
        let content = message.content();
        match message.sender() {
            Sender::System => Self::Annotation,
            Sender::User | Sender::Assistant
                if content.text.is_empty() && content.reasoning.is_empty() =>
            {
                Self::Annotation
            }
            Sender::User | Sender::Assistant => Self::Text,
        }
    }
}

/// Notification payload describing one store change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    Appended {
        index: usize,
        sender: Sender,
        kind: ChangeKind,
    },
    Mutated { index: usize, kind: ChangeKind },
    Closed { index: usize },
    Cleared,
}

/// Receives store notifications around every change.
///
/// `before_change` runs while the store still holds the previous state, which lets an
/// observer sample view state that the change is about to invalidate.
pub trait StoreObserver {
    fn before_change(&mut self, _change: &StoreChange) {}

    fn after_change(&mut self, change: &StoreChange, messages: &[ChatMessage]);
}

impl<T: StoreObserver> StoreObserver for Rc<RefCell<T>> {
    fn before_change(&mut self, change: &StoreChange) {
        self.borrow_mut().before_change(change);
    }

    fn after_change(&mut self, change: &StoreChange, messages: &[ChatMessage]) {
        self.borrow_mut().after_change(change, messages);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered list of displayed messages with derived grouping.
#[derive(Default)]
pub struct MessageStore {
    messages: Vec<ChatMessage>,
    observers: Vec<(SubscriptionId, Box<dyn StoreObserver>)>,
    next_subscription: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: impl StoreObserver + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Returns false when the subscription was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(subscription, _)| *subscription != id);
        self.observers.len() != before
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn get(&self, index: usize) -> Option<&ChatMessage> {
        self.messages.get(index)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_index(&self) -> Option<usize> {
        self.messages.len().checked_sub(1)
    }

    pub fn position(&self, index: usize) -> Option<Position> {
        self.messages.get(index).map(ChatMessage::position)
    }

    /// Appends a message and regroups it together with its predecessor.
    pub fn append(&mut self, mut message: ChatMessage) -> usize {
        let index = self.messages.len();
        let sender = message.sender();
        let kind = ChangeKind::of_appended(&message);
        let change = StoreChange::Appended {
            index,
            sender,
            kind,
        };
        self.notify_before(&change);

        let same_as_previous = self
            .messages
            .last()
            .is_some_and(|previous| previous.sender() == sender);
        message.set_position(Position::from_neighbors(same_as_previous, false));
        self.messages.push(message);

        if same_as_previous {
            self.regroup(index - 1);
        }

        self.notify_after(&change);
        index
    }

    /// Applies an in-place content update. Grouping is never affected.
    pub fn mutate<F>(&mut self, index: usize, kind: ChangeKind, update: F) -> StoreResult<()>
    where
        F: FnOnce(&mut MessageContent),
    {
        self.ensure_live(index, "mutate-message")?;

        let change = StoreChange::Mutated { index, kind };
        self.notify_before(&change);
        if let Some(message) = self.messages.get_mut(index) {
            update(message.content_mut());
        }
        self.notify_after(&change);
        Ok(())
    }

    /// Marks a message finalized. Returns false when it already was, in which case
    /// observers are not notified again.
    pub fn close(&mut self, index: usize) -> StoreResult<bool> {
        self.ensure_live(index, "close-message")?;

        let already_closed = self.messages[index].is_finalized();
        if already_closed {
            return Ok(false);
        }

        let change = StoreChange::Closed { index };
        self.notify_before(&change);
        self.messages[index].finalize();
        self.notify_after(&change);
        Ok(true)
    }

    pub fn clear(&mut self) {
        let change = StoreChange::Cleared;
        self.notify_before(&change);
        self.messages.clear();
        self.notify_after(&change);
    }

    fn ensure_live(&self, index: usize, stage: &'static str) -> StoreResult<()> {
        let len = self.messages.len();
        ensure!(index < len, IndexOutOfRangeSnafu { stage, index, len });
        Ok(())
    }

    fn regroup(&mut self, index: usize) {
        let sender = self.messages[index].sender();
        let same_as_previous = index
            .checked_sub(1)
            .and_then(|previous| self.messages.get(previous))
            .is_some_and(|previous| previous.sender() == sender);
        let same_as_next = self
            .messages
            .get(index + 1)
            .is_some_and(|next| next.sender() == sender);
        self.messages[index].set_position(Position::from_neighbors(same_as_previous, same_as_next));
    }

    fn notify_before(&mut self, change: &StoreChange) {
        for (_, observer) in &mut self.observers {
            observer.before_change(change);
        }
    }

    fn notify_after(&mut self, change: &StoreChange) {
        for (_, observer) in &mut self.observers {
            observer.after_change(change, &self.messages);
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::chat::message::StatusNote;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl StoreObserver for Recorder {
        fn before_change(&mut self, change: &StoreChange) {
            self.events.push(format!("before {change:?}"));
        }

        fn after_change(&mut self, change: &StoreChange, messages: &[ChatMessage]) {
            self.events
                .push(format!("after {change:?} len={}", messages.len()));
        }
    }

    fn message_for(sender: Sender) -> ChatMessage {
        ChatMessage::new(sender, "text")
    }

    fn sender_strategy() -> impl Strategy<Value = Sender> {
        prop_oneof![
            Just(Sender::User),
            Just(Sender::Assistant),
            Just(Sender::System),
        ]
    }

    proptest! {
        #[test]
        fn grouping_follows_neighbor_senders(senders in prop::collection::vec(sender_strategy(), 0..40)) {
            let mut store = MessageStore::new();
            for sender in &senders {
                store.append(message_for(*sender));
            }

            for (index, sender) in senders.iter().enumerate() {
                let same_as_previous = index > 0 && senders[index - 1] == *sender;
                let same_as_next = senders.get(index + 1) == Some(sender);
                prop_assert_eq!(
                    store.position(index),
                    Some(Position::from_neighbors(same_as_previous, same_as_next))
                );
            }
        }
    }

    #[test]
    fn appended_kind_follows_initial_content() {
        assert_eq!(
            ChangeKind::of_appended(&ChatMessage::user("hello")),
            ChangeKind::Text
        );
        assert_eq!(
            ChangeKind::of_appended(&ChatMessage::system("Service configuration reset")),
            ChangeKind::Annotation
        );

        let mut noted = ChatMessage::assistant();
        noted.content_mut().status_note = Some(StatusNote::internal_error());
        assert_eq!(ChangeKind::of_appended(&noted), ChangeKind::Annotation);

        let mut thinking = ChatMessage::assistant();
        thinking.content_mut().reasoning.push_str("hmm");
        assert_eq!(ChangeKind::of_appended(&thinking), ChangeKind::Text);
    }

    #[test]
    fn mutation_keeps_grouping() {
        let mut store = MessageStore::new();
        store.append(ChatMessage::user("one"));
        store.append(ChatMessage::user("two"));

        store
            .mutate(0, ChangeKind::Text, |content| content.text.push_str("!"))
            .unwrap();

        assert_eq!(store.get(0).unwrap().text(), "one!");
        assert_eq!(store.position(0), Some(Position::Start));
        assert_eq!(store.position(1), Some(Position::End));
    }

    #[test]
    fn close_twice_matches_close_once() {
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let mut store = MessageStore::new();
        store.append(ChatMessage::assistant());
        store.subscribe(recorder.clone());

        assert!(store.close(0).unwrap());
        let after_first = (store.messages().to_vec(), recorder.borrow().events.clone());
        assert!(!store.close(0).unwrap());

        assert_eq!(store.messages(), after_first.0.as_slice());
        assert_eq!(recorder.borrow().events, after_first.1);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut store = MessageStore::new();
        store.append(ChatMessage::user("hello"));

        let error = store
            .mutate(3, ChangeKind::Text, |content| content.text.clear())
            .unwrap_err();
        assert!(matches!(
            error,
            StoreError::IndexOutOfRange { index: 3, len: 1, .. }
        ));
        assert!(store.close(1).is_err());
        assert_eq!(store.get(0).unwrap().text(), "hello");
    }

    #[test]
    fn observers_see_before_and_after_in_order() {
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let mut store = MessageStore::new();
        let subscription = store.subscribe(recorder.clone());

        store.append(ChatMessage::user("hello"));
        store
            .mutate(0, ChangeKind::Annotation, |content| {
                content.status_note = None;
            })
            .unwrap();
        store.clear();

        assert_eq!(
            recorder.borrow().events,
            vec![
                "before Appended { index: 0, sender: User, kind: Text }".to_string(),
                "after Appended { index: 0, sender: User, kind: Text } len=1".to_string(),
                "before Mutated { index: 0, kind: Annotation }".to_string(),
                "after Mutated { index: 0, kind: Annotation } len=1".to_string(),
                "before Cleared".to_string(),
                "after Cleared len=0".to_string(),
            ]
        );

        assert!(store.unsubscribe(subscription));
        assert!(!store.unsubscribe(subscription));
        store.append(ChatMessage::user("ignored"));
        assert_eq!(recorder.borrow().events.len(), 6);
    }
}
