// SPDX-License-Identifier: MIT

//! External collaborators the engine drives through a trait: spawning
//! the system SSH binary, the askpass round trip, keyring access, and
//! desktop notifications.

mod askpass;
mod companion_run;
mod keyring;
mod notify;
mod ssh;

pub use askpass::{request_password, AskpassClientError};
pub use companion_run::{
    build_invocation as build_companion_run_invocation, CompanionRunError, CompanionRunRequest, CompanionSpawner,
    SystemCompanionSpawner,
};
pub use keyring::{KeyringError, KeyringProvider, NoopKeyringProvider, OsKeyringProvider};
pub use notify::{DesktopNotifyAdapter, NoopNotifyAdapter, NotifyAdapter, NotifyError};
pub use ssh::{build_invocation as build_ssh_invocation, process_is_ssh, SshError, SshSpawnRequest, SshSpawner, SystemSshSpawner};

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    pub use crate::keyring::fake::InMemoryKeyringProvider;
    pub use crate::notify::fake::{FakeNotifyAdapter, NotifyCall};
}
