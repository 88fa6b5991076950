// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::MethodNum;

use crate::runtime::Runtime;
use crate::runtime::builtins::Type;
use crate::{ActorError, actor_error};

pub const HAMT_BIT_WIDTH: u32 = 5;

/// Types of built-in actors that can be treated as accounts for the purposes of signature
/// validation and the like.
pub const CALLER_TYPES_SIGNABLE: &[Type] = &[Type::Account, Type::Multisig];

/// Method numbers at or above this threshold are exported, callable by any actor.
/// Everything below is reserved for calls between the built-in actors themselves.
pub const FIRST_EXPORTED_METHOD_NUMBER: MethodNum = 1 << 24;

/// Checks that internal (below the exported threshold) methods are only invoked by other
/// built-in actors.
pub fn restrict_internal_api<RT>(rt: &RT, method: MethodNum) -> Result<(), ActorError>
where
    RT: Runtime,
{
    if method >= FIRST_EXPORTED_METHOD_NUMBER {
        return Ok(());
    }
    let caller = rt.message().caller();
    let code_cid = rt.get_actor_code_cid(&caller.id().map_err(|e| {
        actor_error!(forbidden; "caller {} must be an ID address: {}", caller, e)
    })?);
    match code_cid {
        None => Err(
            actor_error!(forbidden; "no code for caller {} of method {}", caller, method),
        ),
        Some(code_cid) => match rt.resolve_builtin_actor_type(&code_cid) {
            None => Err(actor_error!(
                forbidden;
                "caller {} of method {} must be built-in",
                caller,
                method
            )),
            Some(_) => Ok(()),
        },
    }
}
