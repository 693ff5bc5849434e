//! Pure game rules: deck construction, seeded shuffling, dealing, scoring,
//! and special-ability classification. No mutable state lives here; the
//! engine composes these functions.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::cards::{Card, Rank, Suit};

/// Number of cards dealt to each seat.
pub const HAND_SIZE: usize = 4;

/// Hand indices privately revealed during the pregame window.
pub const PREGAME_REVEAL_INDICES: [usize; 2] = [2, 3];

/// Rank-triggered effect executed when the triggering card hits the discard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Ability {
    /// 7, 8: look at one of your own cards
    PeekOwn,
    /// 9, 10: look at one card of another player
    PeekOther,
    /// J, Q: swap two cards without looking at either
    BlindSwap,
    /// K: look at two cards, then optionally swap them
    PeekThenSwap,
}

/// Ability classification by rank. Kings of either color carry the same
/// ability; their scoring values differ.
pub fn ability_for(rank: Rank) -> Option<Ability> {
    match rank {
        Rank::Seven | Rank::Eight => Some(Ability::PeekOwn),
        Rank::Nine | Rank::Ten => Some(Ability::PeekOther),
        Rank::Jack | Rank::Queen => Some(Ability::BlindSwap),
        Rank::King => Some(Ability::PeekThenSwap),
        _ => None,
    }
}

/// Build the standard Cambia deck: 52 suited cards plus two jokers.
pub fn standard_deck() -> Vec<Card> {
    let mut deck = Vec::with_capacity(54);
    for suit in Suit::ALL {
        for rank in Rank::STANDARD {
            deck.push(Card::new(rank, Some(suit)));
        }
    }
    deck.push(Card::new(Rank::Joker, None));
    deck.push(Card::new(Rank::Joker, None));
    deck
}

/// Uniform in-place shuffle. The RNG is injected so tests can seed it.
pub fn shuffle<R: Rng + ?Sized>(deck: &mut [Card], rng: &mut R) {
    deck.shuffle(rng);
}

/// Deal `HAND_SIZE` cards to each seat in order, popping from the deck top.
/// Returns one hand per seat.
pub fn deal(deck: &mut Vec<Card>, seats: usize) -> Vec<Vec<Card>> {
    let mut hands = vec![Vec::with_capacity(HAND_SIZE); seats];
    for _ in 0..HAND_SIZE {
        for hand in &mut hands {
            if let Some(card) = deck.pop() {
                hand.push(card);
            }
        }
    }
    hands
}

/// Sum of card values in a hand.
pub fn score_hand(hand: &[Card]) -> i32 {
    hand.iter().map(Card::value).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn standard_deck_is_fifty_four_cards() {
        let deck = standard_deck();
        assert_eq!(deck.len(), 54);
        let jokers = deck.iter().filter(|c| c.rank == Rank::Joker).count();
        assert_eq!(jokers, 2);
        let ids: HashSet<_> = deck.iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), 54, "card identities must be unique");
    }

    #[test]
    fn deal_takes_from_the_deck_top_in_seat_order() {
        let mut deck = standard_deck();
        let before = deck.len();
        let top = *deck.last().unwrap();
        let hands = deal(&mut deck, 3);
        assert_eq!(hands.len(), 3);
        assert!(hands.iter().all(|h| h.len() == HAND_SIZE));
        assert_eq!(deck.len(), before - 3 * HAND_SIZE);
        // Seat 0 received the previous deck top first
        assert_eq!(hands[0][0], top);
    }

    #[test]
    fn ability_table_matches_ranks() {
        assert_eq!(ability_for(Rank::Seven), Some(Ability::PeekOwn));
        assert_eq!(ability_for(Rank::Eight), Some(Ability::PeekOwn));
        assert_eq!(ability_for(Rank::Nine), Some(Ability::PeekOther));
        assert_eq!(ability_for(Rank::Ten), Some(Ability::PeekOther));
        assert_eq!(ability_for(Rank::Jack), Some(Ability::BlindSwap));
        assert_eq!(ability_for(Rank::Queen), Some(Ability::BlindSwap));
        assert_eq!(ability_for(Rank::King), Some(Ability::PeekThenSwap));
        assert_eq!(ability_for(Rank::Ace), None);
        assert_eq!(ability_for(Rank::Six), None);
        assert_eq!(ability_for(Rank::Joker), None);
    }

    #[test]
    fn seeded_shuffle_is_deterministic() {
        let deck = standard_deck();
        let mut a = deck.clone();
        let mut b = deck;
        shuffle(&mut a, &mut StdRng::seed_from_u64(42));
        shuffle(&mut b, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn shuffle_preserves_the_card_multiset(seed in any::<u64>()) {
            let deck = standard_deck();
            let ids_before: HashSet<_> = deck.iter().map(|c| c.id).collect();
            let mut shuffled = deck;
            shuffle(&mut shuffled, &mut StdRng::seed_from_u64(seed));
            let ids_after: HashSet<_> = shuffled.iter().map(|c| c.id).collect();
            prop_assert_eq!(ids_before, ids_after);
        }

        #[test]
        fn deal_conserves_cards(seed in any::<u64>(), seats in 2usize..6) {
            let mut deck = standard_deck();
            shuffle(&mut deck, &mut StdRng::seed_from_u64(seed));
            let total_before = deck.len();
            let hands = deal(&mut deck, seats);
            let dealt: usize = hands.iter().map(Vec::len).sum();
            prop_assert_eq!(deck.len() + dealt, total_before);
        }

        #[test]
        fn hand_score_is_sum_of_card_values(seed in any::<u64>()) {
            let mut deck = standard_deck();
            shuffle(&mut deck, &mut StdRng::seed_from_u64(seed));
            let hand: Vec<_> = deck.drain(..6).collect();
            let expected: i32 = hand.iter().map(Card::value).sum();
            prop_assert_eq!(score_hand(&hand), expected);
        }
    }
}
