pub mod error;
pub mod flow;
pub mod prefix;
pub mod rule;
pub mod rule_blob;
pub mod rule_store;
pub mod block_allow_list;
pub mod telemetry_log;
pub mod pending;
pub mod preferences;
pub mod profile;
pub mod decision_engine;

pub use error::{PolicyError, PolicyResult};

pub use flow::{Direction, Endpoint, Fingerprint, Flow, Protocol, SubjectKey};

pub use prefix::IpPrefix;

pub use rule::{
    AddressMatch,           // Literal or CIDR address predicate
    Rule,                   // Persisted per-application decision
    RuleAction,             // Allow / block
    RuleBuilder,            // Fluent rule construction
    RuleId,                 // Rule identifier type
    RulePredicate,          // Address / port / protocol match
    RuleSource,             // Provenance (user, prompt, default)
};

pub use rule_blob::{DecodedRules, RULE_BLOB_VERSION};

pub use rule_store::{
    FileSystemResolver, ImportReport, RuleStore, SubjectResolver,
    DEFAULT_STALE_RETENTION_DAYS,
};

pub use block_allow_list::{BlockOrAllowList, ListEntry, LoadStats};

pub use telemetry_log::{
    ConnectionEvent, EventSource, SequenceNumber, TelemetryLog, Verdict,
    DEFAULT_TELEMETRY_CAPACITY,
};

pub use pending::{Enqueued, PendingConnection, PendingConnectionQueue};

pub use preferences::{DefaultAction, Preferences, PreferencesUpdate};

pub use profile::{Profile, ProfileManager, ProfileSnapshot, DEFAULT_PROFILE};

pub use decision_engine::{
    DecisionEngine,         // Flow classification entry point
    Evaluation,             // Verdict plus what produced it
    Outcome,                // Blocked / Allowed / Pending
    Resolution,             // Operator decision, delivered out of band
    ResolutionNotifier,     // Sink for resolutions
    FAIL_SAFE_VERDICT,
};
