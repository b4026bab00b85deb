//! Structured telemetry pipeline for protocol violations.
//!
//! Recoverable anomalies (a message for the wrong role, a phase signal out of order,
//! an input batch that does not line up) do not stop a session. They are reported as
//! structured [`ProtocolViolation`]s that can be:
//!
//! - Logged via tracing (default behavior)
//! - Collected programmatically for testing
//! - Sent to custom observers (metrics, alerting, etc.)
//!
//! # Example
//!
//! ```
//! use fortress_netplay::telemetry::{CollectingObserver, ViolationKind};
//! use std::sync::Arc;
//!
//! let observer = Arc::new(CollectingObserver::new());
//! assert!(!observer.has_violation(ViolationKind::Spectator));
//! ```

use crate::frame_info::IndexedFrame;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Severity of a violation.
///
/// Severities are ordered from least to most severe, allowing filtering
/// and comparison operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable; the offending item was ignored.
    Warning,
    /// Serious issue; behavior may be degraded.
    Error,
    /// Critical invariant broken; state may be corrupted.
    Critical,
}

impl ViolationSeverity {
    /// Returns a string representation suitable for logging/metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categories of violations, one per engine subsystem.
///
/// # Forward Compatibility
///
/// This enum is marked `#[non_exhaustive]`. Always include a wildcard arm when matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// A host phase signal arrived in a state where it is not expected.
    PhaseTransition,
    /// Input history could not take a batch (gap, conflict with a confirmed frame).
    InputSync,
    /// Shared generator state arrived for a role or index that does not expect it.
    Consensus,
    /// Digest queue anomalies.
    DesyncCheck,
    /// Spectator admission or relay problems.
    Spectator,
    /// Unexpected message type or message for the wrong role.
    NetworkProtocol,
    /// Configuration constraint violated at runtime.
    Configuration,
    /// Internal logic error (should never happen).
    InternalError,
    /// Runtime invariant check failed (debug builds or `paranoid` feature).
    Invariant,
}

impl ViolationKind {
    /// Returns a string representation suitable for logging/metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PhaseTransition => "phase_transition",
            Self::InputSync => "input_sync",
            Self::Consensus => "consensus",
            Self::DesyncCheck => "desync_check",
            Self::Spectator => "spectator",
            Self::NetworkProtocol => "network_protocol",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
            Self::Invariant => "invariant",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded violation with everything needed to diagnose it.
///
/// # Example
///
/// ```
/// use fortress_netplay::telemetry::{ProtocolViolation, ViolationSeverity, ViolationKind};
/// use fortress_netplay::IndexedFrame;
///
/// let violation = ProtocolViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::InputSync,
///     "gap in remote inputs",
///     "input_sync.rs:42",
/// ).with_frame(IndexedFrame::new(100, 4))
///  .with_context("expected", "50");
///
/// assert!(violation.to_string().contains("frame=4:100"));
/// ```
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProtocolViolation {
    /// The severity level of this violation.
    pub severity: ViolationSeverity,
    /// The subsystem where the violation occurred.
    pub kind: ViolationKind,
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Source location where the violation was detected (file:line).
    pub location: &'static str,
    /// The indexed frame at which the violation occurred, if applicable.
    pub frame: Option<IndexedFrame>,
    /// Additional structured context as key-value pairs.
    pub context: BTreeMap<String, String>,
}

impl ProtocolViolation {
    /// Creates a new violation.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            frame: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the indexed frame at which this violation occurred.
    #[must_use]
    pub fn with_frame(mut self, frame: IndexedFrame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Adds a context key-value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Serializes this violation to a JSON string.
    ///
    /// Returns `None` if serialization fails (which should not happen for
    /// well-formed violations).
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Serializes this violation to a pretty-printed JSON string.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json_pretty(&self) -> Option<String> {
        serde_json::to_string_pretty(self).ok()
    }
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(frame) = self.frame {
            write!(f, ", frame={frame}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={:?}", self.context)?;
        }
        write!(f, ")")
    }
}

/// Trait for observing violations.
///
/// Observers are shared between a session and its keep-alive thread, so they must be
/// `Send + Sync`.
///
/// ```
/// use fortress_netplay::telemetry::{ViolationObserver, ProtocolViolation};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// struct CountingObserver(AtomicUsize);
///
/// impl ViolationObserver for CountingObserver {
///     fn on_violation(&self, _violation: &ProtocolViolation) {
///         self.0.fetch_add(1, Ordering::Relaxed);
///     }
/// }
/// ```
pub trait ViolationObserver: Send + Sync {
    /// Called when a violation is detected.
    fn on_violation(&self, violation: &ProtocolViolation);
}

/// Built-in observer that logs violations via the `tracing` crate.
///
/// `Warning` maps to `tracing::warn!`, `Error` and `Critical` to `tracing::error!`.
/// Severity, kind, location, frame and context are emitted as structured fields.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    /// Creates a new tracing observer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn format_frame(frame: Option<IndexedFrame>) -> String {
        match frame {
            None => "null".to_owned(),
            Some(f) => f.to_string(),
        }
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let frame_str = Self::format_frame(violation.frame);

        let context_str = if violation.context.is_empty() {
            "{}".to_owned()
        } else {
            let pairs: Vec<String> = violation
                .context
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("{{{}}}", pairs.join(", "))
        };

        match violation.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(
                    severity,
                    kind,
                    location,
                    frame = %frame_str,
                    context = %context_str,
                    "{}",
                    violation.message
                );
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(
                    severity,
                    kind,
                    location,
                    frame = %frame_str,
                    context = %context_str,
                    "{}",
                    violation.message
                );
            },
        }
    }
}

/// Built-in observer that collects violations for testing.
///
/// ```
/// use fortress_netplay::telemetry::{CollectingObserver, ViolationKind, ViolationObserver, ProtocolViolation, ViolationSeverity};
///
/// let observer = CollectingObserver::new();
/// observer.on_violation(&ProtocolViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::Consensus,
///     "rng state for a closed epoch",
///     "test.rs:1",
/// ));
///
/// assert_eq!(observer.len(), 1);
/// assert!(observer.has_violation(ViolationKind::Consensus));
/// ```
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<ProtocolViolation>>,
}

impl CollectingObserver {
    /// Creates a new collecting observer with an empty violation list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            violations: Mutex::new(Vec::new()),
        }
    }

    /// Returns a copy of all collected violations.
    #[must_use]
    pub fn violations(&self) -> Vec<ProtocolViolation> {
        self.violations.lock().clone()
    }

    /// Returns the number of collected violations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Returns true if no violations have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Checks if any violation of the specified kind has been collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// Returns all violations matching the specified kind.
    #[must_use]
    pub fn violations_of_kind(&self, kind: ViolationKind) -> Vec<ProtocolViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.kind == kind)
            .cloned()
            .collect()
    }

    /// Returns all violations at or above the specified severity.
    #[must_use]
    pub fn violations_at_severity(&self, min_severity: ViolationSeverity) -> Vec<ProtocolViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.severity >= min_severity)
            .cloned()
            .collect()
    }

    /// Clears all collected violations.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Forwards violations to several observers, e.g. tracing plus a test collector.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn ViolationObserver>>,
}

impl CompositeObserver {
    /// Creates a new composite observer with no child observers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    /// Adds an observer to the composite.
    pub fn add(&mut self, observer: Arc<dyn ViolationObserver>) {
        self.observers.push(observer);
    }
}

impl ViolationObserver for CompositeObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        for observer in &self.observers {
            observer.on_violation(violation);
        }
    }
}

impl std::fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("num_observers", &self.observers.len())
            .finish()
    }
}

/// Reports a violation with location tracking through the default [`TracingObserver`].
///
/// ```
/// use fortress_netplay::{report_violation, telemetry::{ViolationSeverity, ViolationKind}};
///
/// report_violation!(ViolationSeverity::Warning, ViolationKind::NetworkProtocol,
///     "unexpected {} from peer", "BothInputs");
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}

/// Asserts that no violations have been collected.
///
/// # Panics
///
/// Panics if the observer contains any violations, printing them for debugging.
#[macro_export]
macro_rules! assert_no_violations {
    ($observer:expr) => {{
        let violations = $observer.violations();
        assert!(
            violations.is_empty(),
            "Expected no violations, but found {}:\n{:#?}",
            violations.len(),
            violations
        );
    }};
}

/// Asserts that a violation of the specified kind was collected.
///
/// # Panics
///
/// Panics if no violation of the specified kind was found.
#[macro_export]
macro_rules! assert_violation {
    ($observer:expr, $kind:expr) => {{
        assert!(
            $observer.has_violation($kind),
            "Expected violation of kind {:?}, but found: {:#?}",
            $kind,
            $observer.violations()
        );
    }};
}

/// Reports a violation to an optional observer, falling back to [`TracingObserver`] if `None`.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &ProtocolViolation,
) {
    match observer {
        Some(obs) => obs.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a violation through a session's optional observer, tagged with an indexed frame.
///
/// ```
/// use fortress_netplay::{report_violation_to, IndexedFrame};
/// use fortress_netplay::telemetry::{ViolationSeverity, ViolationKind, CollectingObserver, ViolationObserver};
/// use std::sync::Arc;
///
/// let observer: Option<Arc<dyn ViolationObserver>> = Some(Arc::new(CollectingObserver::new()));
///
/// report_violation_to!(&observer, IndexedFrame::new(3, 1), ViolationSeverity::Warning,
///     ViolationKind::PhaseTransition, "game mode {} outside attract phase", 2);
/// ```
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $frame:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        )
        .with_frame($frame);
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $frame:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        )
        .with_frame($frame);
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
}

// ==========================================
// Runtime Invariant Checking
// ==========================================

/// Result of an invariant check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InvariantViolation {
    /// Name of the type whose invariant was violated.
    pub type_name: &'static str,
    /// Description of the violated invariant.
    pub invariant: String,
    /// Additional diagnostic context.
    pub details: Option<String>,
}

impl InvariantViolation {
    /// Creates a new invariant violation.
    #[must_use]
    pub fn new(type_name: &'static str, invariant: impl Into<String>) -> Self {
        Self {
            type_name,
            invariant: invariant.into(),
            details: None,
        }
    }

    /// Adds additional details to the violation.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Serializes this violation to a JSON string.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.type_name, self.invariant)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

/// Types that maintain internal invariants checkable at runtime.
///
/// Checked in debug builds, or in release builds with the `paranoid` feature, through
/// [`debug_check_invariants!`].
pub trait InvariantChecker {
    /// Returns the first broken invariant, if any.
    fn check_invariants(&self) -> Result<(), InvariantViolation>;
}

/// Checks invariants in debug builds and reports failures as critical violations.
///
/// Compiles to nothing in release builds unless the `paranoid` feature is enabled.
#[macro_export]
#[cfg(any(debug_assertions, feature = "paranoid"))]
macro_rules! debug_check_invariants {
    ($expr:expr) => {{
        use $crate::telemetry::InvariantChecker as _;
        if let Err(violation) = $expr.check_invariants() {
            $crate::report_violation!(
                $crate::telemetry::ViolationSeverity::Critical,
                $crate::telemetry::ViolationKind::Invariant,
                "{}",
                violation
            );
        }
    }};

    ($expr:expr, $context:expr) => {{
        use $crate::telemetry::InvariantChecker as _;
        if let Err(violation) = $expr.check_invariants() {
            $crate::report_violation!(
                $crate::telemetry::ViolationSeverity::Critical,
                $crate::telemetry::ViolationKind::Invariant,
                "{} [context: {}]",
                violation,
                $context
            );
        }
    }};
}

/// No-op version for release builds without `paranoid` feature.
#[macro_export]
#[cfg(not(any(debug_assertions, feature = "paranoid")))]
macro_rules! debug_check_invariants {
    ($expr:expr) => {{}};
    ($expr:expr, $context:expr) => {{}};
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_ordering() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn test_violation_kind_as_str() {
        assert_eq!(ViolationKind::PhaseTransition.as_str(), "phase_transition");
        assert_eq!(ViolationKind::InputSync.as_str(), "input_sync");
        assert_eq!(ViolationKind::DesyncCheck.as_str(), "desync_check");
        assert_eq!(ViolationKind::Spectator.to_string(), "spectator");
    }

    #[test]
    fn test_spec_violation_builder() {
        let violation = ProtocolViolation::new(
            ViolationSeverity::Warning,
            ViolationKind::InputSync,
            "test message",
            "test.rs:42",
        )
        .with_frame(IndexedFrame::new(100, 6))
        .with_context("expected", "10");

        assert_eq!(violation.kind, ViolationKind::InputSync);
        assert_eq!(violation.frame, Some(IndexedFrame::new(100, 6)));
        assert_eq!(violation.context.get("expected"), Some(&"10".to_owned()));

        let display = violation.to_string();
        assert!(display.contains("warning"));
        assert!(display.contains("input_sync"));
        assert!(display.contains("frame=6:100"));
    }

    #[test]
    fn test_collecting_observer_filters() {
        let observer = CollectingObserver::new();
        observer.on_violation(&ProtocolViolation::new(
            ViolationSeverity::Warning,
            ViolationKind::Consensus,
            "a",
            "test.rs:1",
        ));
        observer.on_violation(&ProtocolViolation::new(
            ViolationSeverity::Critical,
            ViolationKind::Invariant,
            "b",
            "test.rs:2",
        ));

        assert_eq!(observer.len(), 2);
        assert_eq!(observer.violations_of_kind(ViolationKind::Consensus).len(), 1);
        assert_eq!(
            observer
                .violations_at_severity(ViolationSeverity::Error)
                .len(),
            1
        );

        observer.clear();
        assert!(observer.is_empty());
    }

    #[test]
    fn test_composite_observer_fans_out() {
        let a = Arc::new(CollectingObserver::new());
        let b = Arc::new(CollectingObserver::new());
        let mut composite = CompositeObserver::new();
        composite.add(a.clone());
        composite.add(b.clone());

        composite.on_violation(&ProtocolViolation::new(
            ViolationSeverity::Error,
            ViolationKind::Spectator,
            "relay",
            "test.rs:1",
        ));

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_report_violation_to_tags_frame() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());

        report_violation_to!(
            &observer,
            IndexedFrame::new(7, 2),
            ViolationSeverity::Warning,
            ViolationKind::NetworkProtocol,
            "unexpected {}",
            "MenuIndex"
        );

        let violations = collector.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].frame, Some(IndexedFrame::new(7, 2)));
        assert_eq!(violations[0].message, "unexpected MenuIndex");
    }

    #[test]
    fn test_collecting_observer_concurrent_writes() {
        use std::thread;

        let observer = Arc::new(CollectingObserver::new());
        let handles: Vec<_> = (0..4)
            .map(|thread_id| {
                let observer = observer.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        observer.on_violation(&ProtocolViolation::new(
                            ViolationSeverity::Warning,
                            ViolationKind::NetworkProtocol,
                            format!("thread {} violation {}", thread_id, i),
                            "concurrent_test.rs:1",
                        ));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("thread should not panic");
        }
        assert_eq!(observer.len(), 200);
    }

    #[test]
    fn test_invariant_violation_display() {
        let violation = InvariantViolation::new("SpectatorRelay", "cursor ahead of frame")
            .with_details("pos=4:30");
        assert_eq!(
            violation.to_string(),
            "SpectatorRelay: cursor ahead of frame (pos=4:30)"
        );
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_to_json_contains_kind() {
        let violation = ProtocolViolation::new(
            ViolationSeverity::Warning,
            ViolationKind::DesyncCheck,
            "queue overflow",
            "desync.rs:1",
        );
        let json = violation.to_json().unwrap();
        assert!(json.contains(r#""kind":"desync_check""#));
        assert!(json.contains(r#""frame":null"#));
    }
}
