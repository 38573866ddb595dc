//! Workflow - natural-language change to pushed branch.
//!
//! ## Overview
//!
//! A session takes a repository, an instruction and two credentials,
//! provisions an isolated workspace, asks a generation provider for a
//! patch, applies it atomically, runs the repository's own tests and, if
//! they pass or none exist, publishes the result as a new branch.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐          ┌──────────────────────────────────────────────────┐
//! │  Caller  │ ───────> │  orchestrator.rs  (WorkflowOrchestrator)         │
//! │  (CLI)   │ <─────── │    ├─ session.rs   (SessionConfig, Session)      │
//! └──────────┘  events  │    └─ progress.rs  (ProgressStream, replay)      │
//!                       │         │                                        │
//!                       │         │ SandboxExecutor::acquire()             │
//!                       │         v                                        │
//!                       │  sandbox/  (DockerSandbox │ LocalSandbox)        │
//!                       │         │                                        │
//!                       │         │ analyze → generate → apply → test      │
//!                       │         v                                        │
//!                       │  analysis.rs  provider.rs  patch.rs  testrun.rs  │
//!                       │         │                                        │
//!                       │         │ DeploymentPublisher::publish()         │
//!                       │         v                                        │
//!                       │  deploy.rs ─> hosting.rs ─> github.rs            │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module      | Responsibility                                            |
//! |-------------|-----------------------------------------------------------|
//! | `analysis`  | File listing, language detection, prompt context          |
//! | `provider`  | `GenerationProvider` trait + OpenAI-compatible client     |
//! | `patch`     | `PatchDescription`, path validation, staged apply         |
//! | `testrun`   | Test-runner detection and execution                       |
//! | `hosting`   | `HostingService` trait                                    |
//! | `github`    | GitHub REST implementation of `HostingService`            |
//! | `deploy`    | Branch naming, one-retry publish                          |

pub mod analysis;
pub mod deploy;
pub mod github;
pub mod hosting;
pub mod orchestrator;
pub mod patch;
pub mod progress;
pub mod provider;
pub mod sandbox;
pub mod session;
pub mod testrun;

#[cfg(test)]
mod test_support;

pub use deploy::{Deployment, DeploymentPublisher};
pub use github::GitHubHosting;
pub use hosting::HostingService;
pub use orchestrator::{OrchestratorSettings, WorkflowOrchestrator};
pub use patch::{AppliedChangeSet, FileChange, PatchDescription};
pub use progress::ProgressStream;
pub use provider::{GenerationProvider, OpenAiProvider};
pub use sandbox::{
    DockerSandbox, LocalSandbox, RepositorySnapshot, SandboxBackend, SandboxExecutor, Workspace,
};
pub use session::{Session, SessionConfig};
