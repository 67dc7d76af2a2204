//! Protocol checker for a session's frame sequence.
//!
//! Feed frames in arrival order to [`TranscriptChecker::observe`]; the report
//! lists every ordering or identity rule the stream broke.

use std::collections::{HashMap, HashSet};

use cardstream_types::{CardId, Stage};

use crate::frame::Frame;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("first frame was '{0}', expected 'skeleton'")]
    SkeletonNotFirst(Stage),

    #[error("more than one skeleton frame")]
    DuplicateSkeleton,

    #[error("card id '{0}' listed twice in the skeleton")]
    DuplicateCardId(CardId),

    #[error("skeleton declares cardCount={declared} but lists {listed} cards")]
    CardCountMismatch { declared: usize, listed: usize },

    #[error("'{stage}' frame for card '{card}' not announced in the skeleton")]
    UnknownCard { card: CardId, stage: Stage },

    #[error("more than one content frame for card '{0}'")]
    DuplicateContent(CardId),

    #[error("image frame for card '{0}' arrived before its content frame")]
    ImageBeforeContent(CardId),

    #[error("more than one image result for card '{0}'")]
    DuplicateImage(CardId),

    #[error("'{0}' frame after done")]
    FrameAfterDone(Stage),

    #[error("done emitted while cards were still pending: {0:?}")]
    DoneBeforeTerminal(Vec<CardId>),
}

#[derive(Debug, Default, Clone)]
struct CardTrack {
    content: bool,
    content_failed: bool,
    image_resolved: bool,
}

impl CardTrack {
    fn is_terminal(&self, expect_images: bool) -> bool {
        if self.content_failed {
            return true;
        }
        self.content && (!expect_images || self.image_resolved)
    }
}

/// Summary of an observed session.
#[derive(Debug, Clone, Default)]
pub struct TranscriptReport {
    pub card_ids: Vec<CardId>,
    pub frames: usize,
    pub content_frames: usize,
    pub image_frames: usize,
    pub error_frames: usize,
    pub completed: bool,
    pub violations: Vec<Violation>,
}

impl TranscriptReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TranscriptChecker {
    expect_images: bool,
    order: Vec<CardId>,
    cards: HashMap<CardId, CardTrack>,
    seen_skeleton: bool,
    done: bool,
    report: TranscriptReport,
}

impl TranscriptChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// With images expected, a card is only terminal once its image (or an
    /// image error) has been reported after its content.
    pub fn expect_images(mut self, expect: bool) -> Self {
        self.expect_images = expect;
        self
    }

    pub fn observe(&mut self, frame: &Frame) {
        let stage = frame.stage();
        self.report.frames += 1;

        if self.done {
            self.violate(Violation::FrameAfterDone(stage));
            return;
        }
        if !self.seen_skeleton && stage != Stage::Skeleton {
            self.violate(Violation::SkeletonNotFirst(stage));
        }

        match frame {
            Frame::Skeleton {
                cards, card_count, ..
            } => {
                if self.seen_skeleton {
                    self.violate(Violation::DuplicateSkeleton);
                    return;
                }
                self.seen_skeleton = true;
                if *card_count != cards.len() {
                    self.violate(Violation::CardCountMismatch {
                        declared: *card_count,
                        listed: cards.len(),
                    });
                }
                let mut unique = HashSet::new();
                for card in cards {
                    if !unique.insert(card.id.clone()) {
                        self.violate(Violation::DuplicateCardId(card.id.clone()));
                        continue;
                    }
                    self.order.push(card.id.clone());
                    self.cards.insert(card.id.clone(), CardTrack::default());
                }
            }
            Frame::Content { card_id, .. } => {
                self.report.content_frames += 1;
                let Some(track) = self.track(card_id, stage) else {
                    return;
                };
                if track.content || track.content_failed {
                    self.violate(Violation::DuplicateContent(card_id.clone()));
                } else {
                    track.content = true;
                }
            }
            Frame::Image { card_id, .. } => {
                self.report.image_frames += 1;
                let Some(track) = self.track(card_id, stage) else {
                    return;
                };
                if !track.content {
                    self.violate(Violation::ImageBeforeContent(card_id.clone()));
                } else if track.image_resolved {
                    self.violate(Violation::DuplicateImage(card_id.clone()));
                } else {
                    track.image_resolved = true;
                }
            }
            Frame::Error { card_id, .. } => {
                self.report.error_frames += 1;
                let Some(card_id) = card_id else {
                    return;
                };
                let Some(track) = self.track(card_id, stage) else {
                    return;
                };
                if !track.content && !track.content_failed {
                    track.content_failed = true;
                } else if track.content && !track.image_resolved {
                    track.image_resolved = true;
                } else {
                    let id = card_id.clone();
                    self.violate(Violation::DuplicateImage(id));
                }
            }
            Frame::Done => {
                self.done = true;
                self.report.completed = true;
                let pending: Vec<CardId> = self
                    .order
                    .iter()
                    .filter(|id| {
                        self.cards
                            .get(*id)
                            .map(|t| !t.is_terminal(self.expect_images))
                            .unwrap_or(true)
                    })
                    .cloned()
                    .collect();
                if !pending.is_empty() {
                    self.violate(Violation::DoneBeforeTerminal(pending));
                }
            }
        }
    }

    pub fn report(&self) -> TranscriptReport {
        let mut report = self.report.clone();
        report.card_ids = self.order.clone();
        report
    }

    fn track(&mut self, card_id: &CardId, stage: Stage) -> Option<&mut CardTrack> {
        if !self.cards.contains_key(card_id) {
            self.violate(Violation::UnknownCard {
                card: card_id.clone(),
                stage,
            });
            return None;
        }
        self.cards.get_mut(card_id)
    }

    fn violate(&mut self, violation: Violation) {
        self.report.violations.push(violation);
    }
}
