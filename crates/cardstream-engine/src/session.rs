//! Session and per-card state machines.

use std::collections::HashMap;
use std::fmt;

use cardstream_types::{
    CardGenerationState, CardId, ContentStatus, ImageStatus, Result, StreamError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    SkeletonSent,
    StreamingCards,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    SkeletonWritten,
    CardsStarted,
    AllCardsTerminal,
    Abort,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Aborted)
    }

    pub fn transition(self, event: SessionEvent) -> Result<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (self, event) {
            (S::Init, E::SkeletonWritten) => Ok(S::SkeletonSent),
            (S::SkeletonSent, E::CardsStarted) => Ok(S::StreamingCards),
            (S::StreamingCards, E::AllCardsTerminal) => Ok(S::Done),
            (S::Init | S::SkeletonSent | S::StreamingCards, E::Abort) => Ok(S::Aborted),
            (S::Done | S::Aborted, _)
            | (S::Init, E::CardsStarted | E::AllCardsTerminal)
            | (S::SkeletonSent, E::SkeletonWritten | E::AllCardsTerminal)
            | (S::StreamingCards, E::SkeletonWritten | E::CardsStarted) => {
                Err(StreamError::InvalidTransition {
                    from: self.to_string(),
                    event: format!("{event:?}"),
                })
            }
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "INIT",
            SessionState::SkeletonSent => "SKELETON_SENT",
            SessionState::StreamingCards => "STREAMING_CARDS",
            SessionState::Done => "DONE",
            SessionState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Per-card progress for one session, in skeleton order.
#[derive(Debug, Default)]
pub struct CardBoard {
    order: Vec<CardId>,
    cards: HashMap<CardId, CardGenerationState>,
}

impl CardBoard {
    pub fn new(cards: impl IntoIterator<Item = (CardId, bool)>) -> Self {
        let mut board = Self::default();
        for (id, wants_image) in cards {
            board.order.push(id.clone());
            board
                .cards
                .insert(id.clone(), CardGenerationState::new(id, wants_image));
        }
        board
    }

    fn card_mut(&mut self, id: &CardId) -> Result<&mut CardGenerationState> {
        self.cards
            .get_mut(id)
            .ok_or_else(|| StreamError::Other(format!("Card '{id}' is not part of this session")))
    }

    pub fn get(&self, id: &CardId) -> Option<&CardGenerationState> {
        self.cards.get(id)
    }

    pub fn content_ready(&mut self, id: &CardId) -> Result<()> {
        self.card_mut(id)?.set_content(ContentStatus::Ready)
    }

    /// Content failure also settles a pending image as cancelled; the card
    /// never gets an image frame.
    pub fn content_failed(&mut self, id: &CardId) -> Result<()> {
        let card = self.card_mut(id)?;
        card.set_content(ContentStatus::Failed)?;
        if card.image == ImageStatus::Generating {
            card.set_image(ImageStatus::Cancelled)?;
        }
        Ok(())
    }

    /// Only valid after content is ready.
    pub fn image_settled(&mut self, id: &CardId, status: ImageStatus) -> Result<()> {
        let card = self.card_mut(id)?;
        if card.content != ContentStatus::Ready {
            return Err(StreamError::InvalidTransition {
                from: format!("content {:?}", card.content),
                event: format!("image {} for card {id}", status.as_str()),
            });
        }
        card.set_image(status)
    }

    pub fn all_terminal(&self) -> bool {
        self.cards.values().all(CardGenerationState::is_terminal)
    }

    /// Cards not yet terminal, in skeleton order.
    pub fn pending(&self) -> Vec<CardId> {
        self.order
            .iter()
            .filter(|id| self.cards.get(*id).is_some_and(|c| !c.is_terminal()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
