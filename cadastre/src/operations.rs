//! Pending operations.
//!
//! A client request that cannot complete immediately is parked here, keeping
//! its reply channel, and retried on every tick and after every ring or
//! space change. Each kind cancels by answering the caller with a
//! [`Cancelled`](crate::AllocError::Cancelled) error; the reply channel
//! fires exactly once either way. Ops are owned by exactly one queue, so
//! cancellation works on the queue element itself and cannot confuse one
//! operation for another.

use tokio::sync::oneshot;

use cadastre_core::{Addr, Cidr};

use crate::allocator::AllocError;

/// Probe consulted before every allocate retry; true aborts the request.
pub(crate) type CancelProbe = Box<dyn Fn() -> bool + Send>;

pub(crate) struct AllocateOp {
    pub ident: String,
    pub within: Cidr,
    pub cancel_probe: CancelProbe,
    pub reply: Option<oneshot::Sender<Result<Addr, AllocError>>>,
}

pub(crate) struct ClaimOp {
    pub ident: String,
    pub cidr: Cidr,
    pub no_error_on_unknown: bool,
    pub reply: Option<oneshot::Sender<Result<(), AllocError>>>,
}

pub(crate) struct ConsenseOp {
    pub reply: Option<oneshot::Sender<Result<(), AllocError>>>,
}

impl AllocateOp {
    pub fn complete(&mut self, result: Result<Addr, AllocError>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }

    pub fn cancel(mut self) {
        let ident = self.ident.clone();
        self.complete(Err(AllocError::Cancelled {
            kind: "allocate",
            ident,
        }));
    }
}

impl ClaimOp {
    pub fn complete(&mut self, result: Result<(), AllocError>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }

    pub fn cancel(mut self) {
        let ident = self.ident.clone();
        self.complete(Err(AllocError::Cancelled {
            kind: "claim",
            ident,
        }));
    }
}

impl ConsenseOp {
    pub fn complete(&mut self) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Ok(()));
        }
    }

    pub fn cancel(mut self) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Err(AllocError::Cancelled {
                kind: "consense",
                ident: String::new(),
            }));
        }
    }
}
