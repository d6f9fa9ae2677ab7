//! Error and outcome types threaded through linking, evaluation and updates.

use std::rc::Rc;

use crate::declaration::Url;

/// Opaque payload carried by a sticky fatal error.
///
/// `dispose`/`prune` callbacks are user code; once one of them throws there is
/// no safe way to recover the carry-over data it was supposed to produce, so
/// every later `request_update` on the owning controller short-circuits with
/// this same record (see [`crate::controller::ReloadableModuleController::fatal_error`]).
#[derive(Debug, Clone)]
pub struct FatalError {
    pub url: Url,
    pub message: Rc<str>,
}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fatal error in {}: {}", self.url, self.message)
    }
}

/// Errors produced while linking, evaluating, or running user callbacks.
///
/// This is the crate's `JsResult`/`JsError` analogue: every fallible
/// operation in `instance`/`controller` returns `Result<_, HotError>`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HotError {
    /// A name failed to resolve, was ambiguous, or a module re-exported `*`
    /// from itself. The ECMAScript analogue is a `SyntaxError` thrown by
    /// `Link`.
    #[error("link error in {url}: {message}")]
    Link { url: Url, message: Rc<str> },

    /// A module's body threw during `evaluate()`.
    #[error("evaluation error in {url}: {message}")]
    Evaluation { url: Url, message: Rc<str> },

    /// A `dispose`/`prune` callback threw. Sticky: the owning controller
    /// records this and returns it unchanged on every later
    /// `request_update`.
    #[error(transparent)]
    Fatal(#[from] FatalErrorWrapper),
}

/// Newtype so `FatalError` (which isn't `std::error::Error`) can participate
/// in `#[from]` conversion without adding an unused `Error` impl to the
/// public, user-facing `FatalError` struct itself.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct FatalErrorWrapper(pub FatalError);

impl From<FatalError> for HotError {
    fn from(value: FatalError) -> Self {
        HotError::Fatal(FatalErrorWrapper(value))
    }
}

/// Errors a `dynamic_import` hook may report to the controller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("could not resolve specifier {specifier:?} from {referrer}")]
    Unresolvable { specifier: String, referrer: Url },
    #[error("host loader failed for {url}: {message}")]
    Host { url: Url, message: Rc<str> },
}

/// The list of modules that declined an invalidated update, returned flat
/// (the distilled spec's `flatten(…)` over the per-SCC `declined` sets).
pub type DeclinedList = Vec<Url>;

/// A node in the human-readable invalidation chain built when an
/// invalidation reaches the root during phase 1 without being accepted.
#[derive(Debug, Clone)]
pub struct ChainNode {
    /// URLs of the SCC this chain entry represents (a single URL for
    /// acyclic modules, more than one for a genuine cycle).
    pub scc: Vec<Url>,
    pub children: Vec<ChainNode>,
    /// True if this entry is a truncation sentinel marking a repeat visit.
    pub truncated: bool,
}

/// Aggregate counters reported alongside a successful or failed update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    pub reevaluations: u32,
    pub loads: u32,
}

/// The typed result of `request_update`, mirroring the distilled spec's
/// status tags exactly (`success`, `declined`, `evaluationError` (sic),
/// `linkError`, `fatalError`, `unaccepted`, `unacceptedEvaluation`).
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Success { stats: UpdateStats },
    Declined { declined: DeclinedList },
    Unaccepted { chain: ChainNode },
    LinkError { error: HotError },
    /// Named `EvaluationError` to match the distilled spec's external status
    /// tag ("evaluationError (sic)"); everywhere else in this crate the Rust
    /// name `HotError::Evaluation` is used for the underlying error.
    EvaluationError { error: HotError, stats: UpdateStats },
    FatalError { error: FatalError },
    UnacceptedEvaluation { stats: UpdateStats },
}

impl UpdateOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UpdateOutcome::Success { .. })
    }
}
