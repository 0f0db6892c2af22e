//! Capability objects injected into every component that touches the host
//! (spec §9: "capability objects over concrete bindings"). Production code
//! and tests share the same orchestration logic by swapping these traits'
//! implementations rather than branching on a test flag.
//!
//! Like the teacher's generic `Vm<E, S, F>` parameterization, [`CommandRunner`]
//! and [`ContainerRuntime`] are threaded through as type parameters
//! (`Executor<R, C>`, `ImagePreparer<R, C>`, `NetworkManager<R>`,
//! `VmmManager<R>`). [`Clock`] is the exception: it is dyn-dispatched as
//! `Arc<dyn Clock>` because it is handed down into `VmmManager`, which is
//! already generic over `CommandRunner` alone — adding a second type
//! parameter there purely to carry `Clock` would ripple out to every caller
//! that names `VmmManager<R>`, for a capability with exactly one production
//! implementation.

mod clock;
mod command;
mod container;

pub use clock::{Clock, SystemClock};
pub use command::{resolve_binary, CommandOutput, CommandRunner, ProcessHandle, TokioCommandRunner};
pub use container::{ContainerRuntime, ShellContainerRuntime};
