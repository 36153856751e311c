//! Account event handlers run by the event worker.
//!
//! Handlers only log today. Each one is safe to run more than once for the same
//! event, since delivery is at-least-once.

use ledger_events_core::account::{AccountCreated, AccountDeposited, AccountWithdrawn};
use ledger_events_core::handler::{EventHandler, HandlerContext, HandlerError, TypedHandler};
use std::sync::Arc;

/// Deposits above this amount raise an alert.
pub const LARGE_DEPOSIT_THRESHOLD: f64 = 10_000.0;

/// Withdrawals leaving less than this balance raise a warning.
pub const LOW_BALANCE_THRESHOLD: f64 = 100.0;

/// Every handler the worker registers.
#[must_use]
pub fn account_handlers() -> Vec<Arc<dyn EventHandler>> {
    vec![
        Arc::new(TypedHandler::new(on_account_created)),
        Arc::new(TypedHandler::new(on_account_deposited)),
        Arc::new(TypedHandler::new(on_account_withdrawn)),
    ]
}

async fn on_account_created(ctx: HandlerContext, event: AccountCreated) -> Result<(), HandlerError> {
    tracing::info!(
        account_id = %event.meta.account_id,
        name = %event.name,
        email = %event.email,
        offset = ctx.offset,
        "Processing account created"
    );
    Ok(())
}

async fn on_account_deposited(
    ctx: HandlerContext,
    event: AccountDeposited,
) -> Result<(), HandlerError> {
    tracing::info!(
        account_id = %event.meta.account_id,
        amount = event.amount,
        current_balance = event.current_balance,
        offset = ctx.offset,
        "Processing deposit"
    );

    if is_large_deposit(&event) {
        tracing::warn!(
            account_id = %event.meta.account_id,
            amount = event.amount,
            alert = "large_deposit",
            "Large deposit detected"
        );
    }
    Ok(())
}

async fn on_account_withdrawn(
    ctx: HandlerContext,
    event: AccountWithdrawn,
) -> Result<(), HandlerError> {
    tracing::info!(
        account_id = %event.meta.account_id,
        amount = event.amount,
        current_balance = event.current_balance,
        offset = ctx.offset,
        "Processing withdrawal"
    );

    if is_low_balance(&event) {
        tracing::warn!(
            account_id = %event.meta.account_id,
            current_balance = event.current_balance,
            alert = "low_balance",
            "Balance low after withdrawal"
        );
    }
    Ok(())
}

fn is_large_deposit(event: &AccountDeposited) -> bool {
    event.amount > LARGE_DEPOSIT_THRESHOLD
}

fn is_low_balance(event: &AccountWithdrawn) -> bool {
    event.current_balance < LOW_BALANCE_THRESHOLD
}
