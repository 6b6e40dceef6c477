//! Domain managers and the controller that composes them.
//!
//! Every manager owns its own map keyed by object path and is only touched
//! from the controller task. Operations that talk to the bus are split in
//! two halves: `begin_*` validates against the model and returns the remote
//! work as a detached future ([`RemoteOp`]), `finish_*` folds the outcome
//! back into the model. `None` from a `begin_*` means there is nothing to
//! do remotely.

use futures::future::BoxFuture;

use crate::error::Result;

pub mod adapter;
pub mod agent;
pub mod audio;
pub mod category;
pub mod controller;
pub mod device;
pub mod transfer;

/// Remote half of an operation, detached from the manager that produced it.
pub type RemoteOp<T> = BoxFuture<'static, Result<T>>;

/// Runs both halves of an operation in place.
pub(crate) async fn complete<M, T, R>(
   manager: &mut M,
   op: Option<RemoteOp<T>>,
   idle: R,
   finish: impl FnOnce(&mut M, Result<T>) -> Result<R>,
) -> Result<R> {
   match op {
      Some(op) => {
         let result = op.await;
         finish(manager, result)
      },
      None => Ok(idle),
   }
}
