//! Shuffle sharding.
//!
//! Each flow is dealt a small "hand" of queues out of a larger "deck". Two
//! flows only interfere when their hands overlap, and with a reasonable
//! deck and hand size most pairs of flows share few or no queues.
//!
//! The dealer turns one 64-bit hash into `hand_size` distinct card indices
//! by reading the hash as a mixed-radix number with radices
//! `deck, deck - 1, ...`, then shifting each digit past the cards already
//! drawn.

use ahash::AHasher;
use std::hash::{Hash, Hasher};

/// Largest supported hand.
pub const MAX_HAND_SIZE: u32 = 15;
/// Largest supported deck.
pub const MAX_DECK_SIZE: u32 = 1 << 26;
const MAX_HASH_BITS: f64 = 60.0;

/// Error returned when a deck/hand combination cannot be dealt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DealerError {
    #[error("deck size must be between 1 and {MAX_DECK_SIZE}, got {0}")]
    DeckSize(u32),
    #[error("hand size must be between 1 and {MAX_HAND_SIZE}, got {0}")]
    HandSize(u32),
    #[error("hand size {hand} exceeds deck size {deck}")]
    HandLargerThanDeck { deck: u32, hand: u32 },
    #[error("deck {deck} with hand {hand} needs more than 60 bits of entropy")]
    NotEnoughEntropy { deck: u32, hand: u32 },
}

/// Deals hands of queue indices from a hash value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dealer {
    deck_size: u32,
    hand_size: u32,
}

impl Dealer {
    /// Create a dealer, checking that the hash carries enough entropy.
    pub fn new(deck_size: u32, hand_size: u32) -> Result<Self, DealerError> {
        if deck_size == 0 || deck_size > MAX_DECK_SIZE {
            return Err(DealerError::DeckSize(deck_size));
        }
        if hand_size == 0 || hand_size > MAX_HAND_SIZE {
            return Err(DealerError::HandSize(hand_size));
        }
        if hand_size > deck_size {
            return Err(DealerError::HandLargerThanDeck {
                deck: deck_size,
                hand: hand_size,
            });
        }
        if required_entropy_bits(deck_size, hand_size) > MAX_HASH_BITS {
            return Err(DealerError::NotEnoughEntropy {
                deck: deck_size,
                hand: hand_size,
            });
        }
        Ok(Self {
            deck_size,
            hand_size,
        })
    }

    pub fn deck_size(&self) -> u32 {
        self.deck_size
    }

    pub fn hand_size(&self) -> u32 {
        self.hand_size
    }

    /// Deal a hand, passing each card to `pick` in draw order.
    pub fn deal(&self, mut hash: u64, mut pick: impl FnMut(usize)) {
        let hand = self.hand_size as usize;
        let mut remainders = [0usize; MAX_HAND_SIZE as usize];
        for (i, slot) in remainders.iter_mut().enumerate().take(hand) {
            let radix = u64::from(self.deck_size) - i as u64;
            *slot = (hash % radix) as usize;
            hash /= radix;
        }
        for i in 0..hand {
            let mut card = remainders[i];
            for j in (0..i).rev() {
                if card >= remainders[j] {
                    card += 1;
                }
            }
            pick(card);
        }
    }

    /// Deal a hand into a vector.
    pub fn deal_into_hand(&self, hash: u64) -> Vec<usize> {
        let mut hand = Vec::with_capacity(self.hand_size as usize);
        self.deal(hash, |card| hand.push(card));
        hand
    }
}

fn required_entropy_bits(deck_size: u32, hand_size: u32) -> f64 {
    f64::from(deck_size).log2() * f64::from(hand_size)
}

/// Hash identifying a flow: the schema name plus its distinguisher.
pub fn flow_hash(flow_schema: &str, distinguisher: &str) -> u64 {
    let mut hasher = AHasher::default();
    flow_schema.hash(&mut hasher);
    distinguisher.hash(&mut hasher);
    hasher.finish()
}
