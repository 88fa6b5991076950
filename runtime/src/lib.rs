// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_shared::bigint::BigInt;
use fvm_shared::error::{ErrorNumber, ExitCode};
use fvm_shared::Response;

pub use self::actor_error::*;
pub use self::builtin::*;
pub use self::dispatch::*;
pub use self::util::*;
use crate::runtime::Runtime;

pub mod actor_error;
pub mod builtin;
pub mod cbor;
mod dispatch;
pub mod runtime;
#[cfg(feature = "test_utils")]
pub mod test_utils;
pub mod util;

pub use builtin::reward;

/// Accounting for deal weights in sectors, in units of byte-epochs.
pub type DealWeight = BigInt;

/// An error returned on a failed send. Can be automatically converted into an
/// [`ActorError`] with the question mark operator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SendError(pub ErrorNumber);

impl From<SendError> for ErrorNumber {
    fn from(s: SendError) -> ErrorNumber {
        s.0
    }
}

impl From<SendError> for ActorError {
    fn from(s: SendError) -> ActorError {
        match s.0 {
            // Some of these errors are from operations in the Runtime or SDK layer
            // before or after the underlying VM send syscall.
            ErrorNumber::NotFound => {
                // This means that the receiving actor doesn't exist.
                ActorError::unchecked(ExitCode::SYS_INVALID_RECEIVER, "receiver not found".into())
            }
            ErrorNumber::InsufficientFunds => {
                // This means that the send failed because we have insufficient funds. We will
                // get a _syscall error_, not an exit code, because the target actor will not
                // run (and therefore will not exit).
                ActorError::unchecked(
                    ExitCode::SYS_INSUFFICIENT_FUNDS,
                    "not enough funds".into(),
                )
            }
            ErrorNumber::LimitExceeded => {
                // This means we've exceeded the recursion limit.
                ActorError::unchecked(ExitCode::SYS_ASSERTION_FAILED, "recursion limit".into())
            }
            err => {
                // We don't expect any other syscall exit codes.
                ActorError::unchecked(ExitCode::SYS_ASSERTION_FAILED, format!("unexpected error: {}", err))
            }
        }
    }
}

/// Converts a send result into the raw return data of a successful send,
/// adopting the exit code of an aborted callee as this call's error.
pub fn extract_send_result(
    res: Result<Response, SendError>,
) -> Result<Option<IpldBlock>, ActorError> {
    let ret = res?;
    if ret.exit_code.is_success() {
        Ok(ret.return_data)
    } else {
        Err(ActorError::checked(
            ret.exit_code,
            format!("send aborted with code {}", ret.exit_code),
            ret.return_data,
        ))
    }
}

/// Resolves an address to an actor ID, failing with an illegal-argument error if the
/// address cannot be resolved to any current actor.
pub fn resolve_to_actor_id(
    rt: &impl Runtime,
    address: &fvm_shared::address::Address,
) -> Result<fvm_shared::ActorID, ActorError> {
    rt.resolve_address(address).ok_or_else(|| {
        crate::actor_error!(illegal_argument, "failed to resolve address {}", address)
    })
}
