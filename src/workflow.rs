use crate::protocol::ReplyAction;
use serde::{Deserialize, Serialize};
use std::fmt;

pub struct Transition<S, C> {
    pub from: S,
    pub to: S,
    pub guard: fn(&C) -> bool,
    pub label: &'static str,
}

pub struct TransitionTable<S: 'static, C: 'static> {
    rows: &'static [Transition<S, C>],
}

impl<S: Copy + PartialEq + 'static, C: 'static> TransitionTable<S, C> {
    pub const fn new(rows: &'static [Transition<S, C>]) -> Self {
        Self { rows }
    }

    pub fn next(&self, from: S, ctx: &C) -> Option<&'static Transition<S, C>> {
        self.rows.iter().find(|row| row.from == from && (row.guard)(ctx))
    }

    pub fn targets(&self, from: S) -> Vec<S> {
        let mut targets = Vec::new();
        for row in self.rows.iter().filter(|row| row.from == from) {
            if !targets.contains(&row.to) {
                targets.push(row.to);
            }
        }
        targets
    }

    pub fn allows(&self, from: S, to: S) -> bool {
        self.rows.iter().any(|row| row.from == from && row.to == to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuyerStep {
    Discover,
    Select,
    Negotiate,
    Pay,
    Complete,
    Failed,
}

impl BuyerStep {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuyerStep::Complete | BuyerStep::Failed)
    }
}

impl fmt::Display for BuyerStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuyerStep::Discover => "discover",
            BuyerStep::Select => "select",
            BuyerStep::Negotiate => "negotiate",
            BuyerStep::Pay => "pay",
            BuyerStep::Complete => "complete",
            BuyerStep::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuyerSignals {
    pub candidates: usize,
    pub selected: bool,
    pub reply: Option<ReplyAction>,
    pub rounds_exhausted: bool,
    pub contended: bool,
    pub untried_candidates: usize,
    pub payment_confirmed: bool,
}

fn has_candidates(s: &BuyerSignals) -> bool {
    s.candidates > 0
}

fn no_candidates(s: &BuyerSignals) -> bool {
    s.candidates == 0
}

fn selected(s: &BuyerSignals) -> bool {
    s.selected
}

fn nothing_selected(s: &BuyerSignals) -> bool {
    !s.selected
}

fn accepted(s: &BuyerSignals) -> bool {
    !s.contended && s.reply == Some(ReplyAction::Accept)
}

fn countered_with_rounds_left(s: &BuyerSignals) -> bool {
    !s.contended && s.reply == Some(ReplyAction::Counter) && !s.rounds_exhausted
}

fn session_lost(s: &BuyerSignals) -> bool {
    s.contended
        || s.reply == Some(ReplyAction::Reject)
        || (s.reply == Some(ReplyAction::Counter) && s.rounds_exhausted)
        || s.reply.is_none()
}

fn lost_with_alternatives(s: &BuyerSignals) -> bool {
    session_lost(s) && s.untried_candidates > 0
}

fn lost_without_alternatives(s: &BuyerSignals) -> bool {
    session_lost(s) && s.untried_candidates == 0
}

fn payment_confirmed(s: &BuyerSignals) -> bool {
    s.payment_confirmed
}

fn payment_not_confirmed(s: &BuyerSignals) -> bool {
    !s.payment_confirmed
}

pub static BUYER_TRANSITIONS: TransitionTable<BuyerStep, BuyerSignals> = TransitionTable::new(&[
    Transition { from: BuyerStep::Discover, to: BuyerStep::Select, guard: has_candidates, label: "listings found" },
    Transition { from: BuyerStep::Discover, to: BuyerStep::Failed, guard: no_candidates, label: "nothing to buy" },
    Transition { from: BuyerStep::Select, to: BuyerStep::Negotiate, guard: selected, label: "candidate chosen" },
    Transition { from: BuyerStep::Select, to: BuyerStep::Failed, guard: nothing_selected, label: "no acceptable candidate" },
    Transition { from: BuyerStep::Negotiate, to: BuyerStep::Pay, guard: accepted, label: "offer accepted" },
    Transition { from: BuyerStep::Negotiate, to: BuyerStep::Negotiate, guard: countered_with_rounds_left, label: "counter offer" },
    Transition { from: BuyerStep::Negotiate, to: BuyerStep::Select, guard: lost_with_alternatives, label: "try next candidate" },
    Transition { from: BuyerStep::Negotiate, to: BuyerStep::Failed, guard: lost_without_alternatives, label: "negotiation exhausted" },
    Transition { from: BuyerStep::Pay, to: BuyerStep::Complete, guard: payment_confirmed, label: "payment confirmed" },
    Transition { from: BuyerStep::Pay, to: BuyerStep::Failed, guard: payment_not_confirmed, label: "payment failed" },
]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SellerStep {
    List,
    Wait,
    Evaluate,
    Accept,
    Ship,
}

impl fmt::Display for SellerStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SellerStep::List => "list",
            SellerStep::Wait => "wait",
            SellerStep::Evaluate => "evaluate",
            SellerStep::Accept => "accept",
            SellerStep::Ship => "ship",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SellerSignals {
    pub published: bool,
    pub offer_queued: bool,
    pub verdict_acceptable: bool,
    pub payment_confirmed: bool,
}

fn published(s: &SellerSignals) -> bool {
    s.published
}

fn offer_queued(s: &SellerSignals) -> bool {
    s.offer_queued && !s.payment_confirmed
}

fn verdict_acceptable(s: &SellerSignals) -> bool {
    s.verdict_acceptable
}

fn verdict_not_acceptable(s: &SellerSignals) -> bool {
    !s.verdict_acceptable
}

fn seller_paid(s: &SellerSignals) -> bool {
    s.payment_confirmed
}

fn seller_unpaid(s: &SellerSignals) -> bool {
    !s.payment_confirmed
}

pub static SELLER_TRANSITIONS: TransitionTable<SellerStep, SellerSignals> = TransitionTable::new(&[
    Transition { from: SellerStep::List, to: SellerStep::Wait, guard: published, label: "listing active" },
    Transition { from: SellerStep::Wait, to: SellerStep::Ship, guard: seller_paid, label: "payment confirmed" },
    Transition { from: SellerStep::Wait, to: SellerStep::Evaluate, guard: offer_queued, label: "offer received" },
    Transition { from: SellerStep::Evaluate, to: SellerStep::Accept, guard: verdict_acceptable, label: "offer acceptable" },
    Transition { from: SellerStep::Evaluate, to: SellerStep::Wait, guard: verdict_not_acceptable, label: "countered or rejected" },
    Transition { from: SellerStep::Accept, to: SellerStep::Ship, guard: seller_paid, label: "payment confirmed" },
    Transition { from: SellerStep::Accept, to: SellerStep::Wait, guard: seller_unpaid, label: "awaiting payment" },
]);

#[cfg(test)]
mod tests {
    use super::*;

    fn buyer(f: impl FnOnce(&mut BuyerSignals)) -> BuyerSignals {
        let mut s = BuyerSignals::default();
        f(&mut s);
        s
    }

    #[test]
    fn test_discover_guards() {
        let found = buyer(|s| s.candidates = 2);
        assert_eq!(BUYER_TRANSITIONS.next(BuyerStep::Discover, &found).unwrap().to, BuyerStep::Select);
        let none = BuyerSignals::default();
        assert_eq!(BUYER_TRANSITIONS.next(BuyerStep::Discover, &none).unwrap().to, BuyerStep::Failed);
    }

    #[test]
    fn test_negotiate_guards() {
        let accept = buyer(|s| s.reply = Some(ReplyAction::Accept));
        assert_eq!(BUYER_TRANSITIONS.next(BuyerStep::Negotiate, &accept).unwrap().to, BuyerStep::Pay);

        let counter = buyer(|s| s.reply = Some(ReplyAction::Counter));
        assert_eq!(
            BUYER_TRANSITIONS.next(BuyerStep::Negotiate, &counter).unwrap().to,
            BuyerStep::Negotiate
        );

        let capped = buyer(|s| {
            s.reply = Some(ReplyAction::Counter);
            s.rounds_exhausted = true;
        });
        assert_eq!(BUYER_TRANSITIONS.next(BuyerStep::Negotiate, &capped).unwrap().to, BuyerStep::Failed);

        let contended = buyer(|s| {
            s.contended = true;
            s.untried_candidates = 1;
        });
        assert_eq!(
            BUYER_TRANSITIONS.next(BuyerStep::Negotiate, &contended).unwrap().to,
            BuyerStep::Select
        );

        let rejected = buyer(|s| s.reply = Some(ReplyAction::Reject));
        assert_eq!(BUYER_TRANSITIONS.next(BuyerStep::Negotiate, &rejected).unwrap().to, BuyerStep::Failed);
    }

    #[test]
    fn test_every_nonterminal_buyer_step_has_an_exit() {
        for step in [BuyerStep::Discover, BuyerStep::Select, BuyerStep::Negotiate, BuyerStep::Pay] {
            assert!(!BUYER_TRANSITIONS.targets(step).is_empty(), "{}", step);
            assert!(BUYER_TRANSITIONS.allows(step, BuyerStep::Failed), "{}", step);
        }
        assert!(BUYER_TRANSITIONS.targets(BuyerStep::Complete).is_empty());
        assert!(BUYER_TRANSITIONS.targets(BuyerStep::Failed).is_empty());
        assert!(!BUYER_TRANSITIONS.allows(BuyerStep::Discover, BuyerStep::Pay));
    }

    #[test]
    fn test_seller_guards() {
        let offer = SellerSignals {
            offer_queued: true,
            ..Default::default()
        };
        assert_eq!(SELLER_TRANSITIONS.next(SellerStep::Wait, &offer).unwrap().to, SellerStep::Evaluate);
        assert!(SELLER_TRANSITIONS.next(SellerStep::Wait, &SellerSignals::default()).is_none());

        let good = SellerSignals {
            verdict_acceptable: true,
            ..Default::default()
        };
        assert_eq!(SELLER_TRANSITIONS.next(SellerStep::Evaluate, &good).unwrap().to, SellerStep::Accept);
        assert_eq!(SELLER_TRANSITIONS.next(SellerStep::Accept, &good).unwrap().to, SellerStep::Wait);
        assert_eq!(
            SELLER_TRANSITIONS.next(SellerStep::Evaluate, &SellerSignals::default()).unwrap().to,
            SellerStep::Wait
        );

        let paid = SellerSignals {
            payment_confirmed: true,
            offer_queued: true,
            ..Default::default()
        };
        assert_eq!(SELLER_TRANSITIONS.next(SellerStep::Wait, &paid).unwrap().to, SellerStep::Ship);
        assert_eq!(SELLER_TRANSITIONS.next(SellerStep::Accept, &paid).unwrap().to, SellerStep::Ship);
        assert!(SELLER_TRANSITIONS.targets(SellerStep::Ship).is_empty());
    }
}
