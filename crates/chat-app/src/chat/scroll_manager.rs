use crate::chat::message::{ChatMessage, Sender};
use crate::chat::message_list::{ChangeKind, StoreChange, StoreObserver};

/// Near-bottom distance for fine-grained text streaming.
pub const TEXT_FOLLOW_THRESHOLD_PX: f32 = 24.0;
/// Near-bottom distance for coarse status and tool annotations.
pub const ANNOTATION_FOLLOW_THRESHOLD_PX: f32 = 750.0;

/// Returns true when a viewport sampled `distance_from_bottom` pixels above the tail
/// should follow the content that is about to grow.
pub fn should_follow(distance_from_bottom: f32, threshold_px: f32) -> bool {
    // Layouts that are not measured yet report NaN; an overscrolled tail reports a
    // negative distance. Both count as sitting at the bottom.
    if distance_from_bottom.is_nan() || distance_from_bottom <= 0.0 {
        return true;
    }
    distance_from_bottom <= threshold_px
}

/// Scrollable surface the coordinator drives.
pub trait Viewport {
    fn distance_from_bottom(&self) -> f32;
    fn scroll_to_bottom(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FollowThresholds {
    pub text_px: f32,
    pub annotation_px: f32,
}

impl Default for FollowThresholds {
    fn default() -> Self {
        Self {
            text_px: TEXT_FOLLOW_THRESHOLD_PX,
            annotation_px: ANNOTATION_FOLLOW_THRESHOLD_PX,
        }
    }
}

impl FollowThresholds {
    pub fn for_kind(&self, kind: ChangeKind) -> f32 {
        match kind {
            ChangeKind::Text => self.text_px,
            ChangeKind::Annotation => self.annotation_px,
        }
    }
}

/// Keeps a viewport pinned to the tail while the user stays near it.
///
/// The distance is sampled before every store change and the scroll is applied after
/// it, so content growth alone never counts as the user scrolling away.
pub struct FollowCoordinator<V> {
    viewport: V,
    thresholds: FollowThresholds,
    sampled_distance: Option<f32>,
    last_decision: Option<bool>,
}

impl<V: Viewport> FollowCoordinator<V> {
    pub fn new(viewport: V, thresholds: FollowThresholds) -> Self {
        Self {
            viewport,
            thresholds,
            sampled_distance: None,
            last_decision: None,
        }
    }

    pub fn viewport(&self) -> &V {
        &self.viewport
    }

    pub fn viewport_mut(&mut self) -> &mut V {
        &mut self.viewport
    }

    pub fn thresholds(&self) -> FollowThresholds {
        self.thresholds
    }

    /// Whether the most recent change scrolled the viewport.
    pub fn last_decision(&self) -> Option<bool> {
        self.last_decision
    }

    fn decide(&self, change: &StoreChange, distance: f32) -> Option<bool> {
        let kind = match *change {
            StoreChange::Appended {
                sender: Sender::User,
                ..
            }
            | StoreChange::Cleared => return Some(true),
            StoreChange::Appended { kind, .. } => kind,
            StoreChange::Mutated { kind, .. } => kind,
            StoreChange::Closed { .. } => return None,
        };
        Some(should_follow(distance, self.thresholds.for_kind(kind)))
    }
}

impl<V: Viewport> StoreObserver for FollowCoordinator<V> {
    fn before_change(&mut self, _change: &StoreChange) {
        self.sampled_distance = Some(self.viewport.distance_from_bottom());
    }

    fn after_change(&mut self, change: &StoreChange, _messages: &[ChatMessage]) {
        let distance = self.sampled_distance.take().unwrap_or(0.0);
        let Some(follow) = self.decide(change, distance) else {
            return;
        };

        if follow {
            self.viewport.scroll_to_bottom();
        }
        self.last_decision = Some(follow);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::chat::message_list::MessageStore;

    /// Viewport whose content grows by a fixed amount on every change.
    #[derive(Default)]
    struct FakeViewport {
        distance: f32,
        scrolls: usize,
    }

    impl Viewport for FakeViewport {
        fn distance_from_bottom(&self) -> f32 {
            self.distance
        }

        fn scroll_to_bottom(&mut self) {
            self.distance = 0.0;
            self.scrolls += 1;
        }
    }

    #[test]
    fn should_follow_within_threshold() {
        assert!(should_follow(0.0, TEXT_FOLLOW_THRESHOLD_PX));
        assert!(should_follow(24.0, TEXT_FOLLOW_THRESHOLD_PX));
        assert!(!should_follow(24.5, TEXT_FOLLOW_THRESHOLD_PX));
        assert!(should_follow(400.0, ANNOTATION_FOLLOW_THRESHOLD_PX));
        assert!(should_follow(-3.0, TEXT_FOLLOW_THRESHOLD_PX));
        assert!(should_follow(f32::NAN, TEXT_FOLLOW_THRESHOLD_PX));
        assert!(!should_follow(f32::INFINITY, ANNOTATION_FOLLOW_THRESHOLD_PX));
    }

    #[test]
    fn text_streaming_stops_following_after_user_scrolls_up() {
        let coordinator = Rc::new(RefCell::new(FollowCoordinator::new(
            FakeViewport::default(),
            FollowThresholds::default(),
        )));
        let mut store = MessageStore::new();
        store.subscribe(coordinator.clone());

        let index = store.append(ChatMessage::assistant());
        store
            .mutate(index, ChangeKind::Text, |content| content.text.push('a'))
            .unwrap();
        assert_eq!(coordinator.borrow().last_decision(), Some(true));

        coordinator.borrow_mut().viewport_mut().distance = 120.0;
        store
            .mutate(index, ChangeKind::Text, |content| content.text.push('b'))
            .unwrap();
        assert_eq!(coordinator.borrow().last_decision(), Some(false));
        assert_eq!(coordinator.borrow().viewport().distance, 120.0);

        // Annotations are coarse, so the same distance still follows.
        store
            .mutate(index, ChangeKind::Annotation, |content| {
                content.status_note = None;
            })
            .unwrap();
        assert_eq!(coordinator.borrow().last_decision(), Some(true));
    }

    #[test]
    fn user_messages_and_clear_always_follow() {
        let coordinator = Rc::new(RefCell::new(FollowCoordinator::new(
            FakeViewport {
                distance: 5_000.0,
                scrolls: 0,
            },
            FollowThresholds::default(),
        )));
        let mut store = MessageStore::new();
        store.subscribe(coordinator.clone());

        store.append(ChatMessage::user("hello"));
        assert_eq!(coordinator.borrow().viewport().scrolls, 1);

        coordinator.borrow_mut().viewport_mut().distance = 5_000.0;
        store.clear();
        assert_eq!(coordinator.borrow().viewport().scrolls, 2);
    }

    #[test]
    fn appended_message_uses_its_content_kind() {
        let coordinator = Rc::new(RefCell::new(FollowCoordinator::new(
            FakeViewport {
                distance: 300.0,
                scrolls: 0,
            },
            FollowThresholds::default(),
        )));
        let mut store = MessageStore::new();
        store.subscribe(coordinator.clone());

        let mut tool_first = ChatMessage::assistant();
        tool_first.content_mut().status_note = Some(crate::chat::StatusNote::interrupted());
        store.append(tool_first);
        assert_eq!(coordinator.borrow().last_decision(), Some(true));

        coordinator.borrow_mut().viewport_mut().distance = 300.0;
        store.append(ChatMessage::new(Sender::Assistant, "text"));
        assert_eq!(coordinator.borrow().last_decision(), Some(false));
    }

    #[test]
    fn closing_does_not_scroll() {
        let coordinator = Rc::new(RefCell::new(FollowCoordinator::new(
            FakeViewport::default(),
            FollowThresholds::default(),
        )));
        let mut store = MessageStore::new();
        let index = store.append(ChatMessage::assistant());
        store.subscribe(coordinator.clone());

        store.close(index).unwrap();
        assert_eq!(coordinator.borrow().viewport().scrolls, 0);
        assert_eq!(coordinator.borrow().last_decision(), None);
    }
}
