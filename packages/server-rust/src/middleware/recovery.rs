//! Fault barrier: the outermost middleware.
//!
//! A panic anywhere below is caught at this layer and turned into a
//! `500 INTERNAL_ERROR` status, so one bad call never takes down the process.
//! The panic-site backtrace is captured by a process-wide panic hook and
//! logged alongside the panic message.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};

use async_trait::async_trait;
use futures_util::FutureExt;
use gantry_core::status::{Status, REASON_INTERNAL};
use tracing::error;

use super::{BoxHandler, CallContext, CallResult, Handler, Middleware, Payload};

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

// Chains onto the existing hook so default panic output is unchanged.
fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_backtrace() -> String {
    LAST_BACKTRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_default()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Converts panics in the wrapped chain into internal-error statuses.
#[derive(Debug, Clone, Copy)]
pub struct Recovery;

impl Recovery {
    /// Creates the middleware and installs the backtrace hook (once per process).
    #[must_use]
    pub fn new() -> Self {
        install_panic_hook();
        Self
    }
}

impl Default for Recovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for Recovery {
    fn name(&self) -> &str {
        "recovery"
    }

    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(RecoveryHandler { next })
    }
}

struct RecoveryHandler {
    next: BoxHandler,
}

#[async_trait]
impl Handler for RecoveryHandler {
    async fn call(&self, ctx: CallContext, payload: Payload) -> CallResult {
        let kind = ctx.kind;
        let operation = ctx.operation.clone();

        match AssertUnwindSafe(self.next.call(ctx, payload))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(&*panic);
                let stack = take_backtrace();
                error!(
                    kind = %kind,
                    operation = %operation,
                    panic = %message,
                    stack = %stack,
                    "panic recovered"
                );
                Err(Status::internal(
                    REASON_INTERNAL,
                    format!("panic recovered: {message}"),
                ))
            }
        }
    }
}
