// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_shared::MethodNum;

use crate::ActorError;
use crate::runtime::Runtime;

/// Interface for invoking methods on an Actor
pub trait ActorCode {
    type Methods;

    /// The name of the actor type.
    /// This should be eagerly evaluated by the compiler (no allocations).
    fn name() -> &'static str;

    /// Invokes method with runtime on the actor's code. Method number will match one
    /// defined by the actor, and parameters will be serialized and used in execution
    fn invoke_method<RT>(
        rt: &RT,
        method: MethodNum,
        params: Option<IpldBlock>,
    ) -> Result<Option<IpldBlock>, ActorError>
    where
        // The remaining `&self` methods on the blockstore proxy to a `Rc` of the real
        // blockstore in testing environments.
        RT: Runtime,
        RT::Blockstore: Clone;
}
