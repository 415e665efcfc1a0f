//! Fixtures shared by unit tests.

use crate::model::{
    ExitReason, IntentAction, IntentKind, IntentStatus, Market, NewIntent, NewOrder, Position,
    Side,
};
use crate::persistence::{insert_order, insert_position, Store};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

pub(crate) fn market(id: &str) -> Market {
    Market {
        market_id: id.to_string(),
        question: format!("Will {} resolve yes?", id),
        tags: vec![],
        outcome_tokens: vec![format!("{}-no", id), format!("{}-yes", id)],
        resolves_at: None,
        active: true,
    }
}

/// Insert an ordered intent plus its `submitted` order on outcome 1.
pub(crate) fn seed_order(
    store: &Store,
    market_id: &str,
    kind: IntentKind,
    quantity: Decimal,
    limit_price: Decimal,
    now: DateTime<Utc>,
) -> i64 {
    let action = match kind {
        IntentKind::Entry => IntentAction::Open {
            size_usd: quantity.abs() * limit_price,
        },
        IntentKind::Exit => IntentAction::Close {
            quantity,
            exit_reason: ExitReason::TakeProfit,
        },
    };
    let intent_id = store
        .insert_intent(
            &NewIntent {
                strategy: "mr".to_string(),
                market_id: market_id.to_string(),
                outcome: 1,
                side: Side::from_signed(quantity),
                action,
                signal_price: limit_price,
                avg_price: None,
                dislocation: None,
                reason: "fixture".to_string(),
                created_at: now,
                expires_at: now + Duration::minutes(2),
            },
            IntentStatus::Ordered,
        )
        .unwrap();

    insert_order(
        store.conn(),
        &NewOrder {
            strategy: "mr".to_string(),
            market_id: market_id.to_string(),
            outcome: 1,
            token_id: format!("{}-yes", market_id),
            kind,
            quantity,
            limit_price,
            paper: true,
            intent_id,
            metadata: serde_json::json!({ "intent_id": intent_id }),
            created_at: now,
        },
    )
    .unwrap()
    .unwrap()
}

/// Insert an open long position on outcome 1.
pub(crate) fn seed_position(
    store: &Store,
    market_id: &str,
    quantity: Decimal,
    price: Decimal,
    now: DateTime<Utc>,
) -> Position {
    let mut position = Position::flat("mr", market_id, 1, true, now);
    position.apply_fill(quantity, price, now);
    position.id = insert_position(store.conn(), &position).unwrap();
    position.version = 1;
    position
}
