#![deny(missing_docs)]

//! # cohort_relay
//!
//! Client side of a privacy-preserving survey aggregation protocol.  A fleet
//! of independent daemons discovers surveys from a central coordinator, signs
//! up for those commissioned by a trusted organisation, and is grouped into
//! anonymity sets.  One member of each group is elected delegate; the others
//! encrypt their binned answers under the delegate's aggregation key and send
//! them over.  The delegate combines every contribution homomorphically,
//! decrypts only the sum and submits it.  No party sees another member's
//! individual answer.
//!
//! ## Layout
//!
//! * [`interval`] and [`response`] turn locally stored values into per-cohort
//!   counts.
//! * [`encryption`] provides the additive scheme (exponential ElGamal over
//!   secp256k1) and an identity stand-in; [`aggregate`] combines ciphertexts.
//! * [`signup`] holds the per-survey state machine, [`storage`] persists it
//!   and [`daemon`] drives it one cycle at a time.
//! * [`net`] (feature `net`) contains the HTTP coordinator client and the
//!   local status service.
//!
//! ## Usage
//!
//! ```rust
//! use cohort_relay::{build_query_response, Query};
//!
//! let cohorts = ["[8,16)", "[16,32)", "[32,64)"].map(String::from).to_vec();
//! let query = Query::new("q1", "age", cohorts, false);
//! let counts = build_query_response(&query, &["8", "16", "31"]).unwrap();
//! assert_eq!(counts.cohort_data["[16,32)"], 2);
//! ```

pub mod aggregate;
pub mod config;
pub mod daemon;
pub mod encryption;
pub mod interval;
pub mod network;
pub mod policy;
pub mod response;
pub mod signup;
pub mod storage;
pub mod survey;

#[cfg(feature = "net")]
pub mod net;

pub use aggregate::{aggregate, AggregationError};
pub use config::{ConfigError, DaemonConfig, EncryptionMode};
pub use daemon::{CycleReport, Daemon};
pub use encryption::{AggregationKeyPair, Ciphertext, Encryption, EncryptionError};
pub use interval::{Interval, IntervalParseError};
pub use network::{Network, TransportError};
pub use policy::{CommissionerPolicy, PolicyError};
pub use response::{
    build_query_response, build_survey_response, EncryptedQueryResponse, EncryptedSurveyResponse,
    PlainQueryResponse, PlainSurveyResponse, QueryResponse, SurveyResponse,
};
pub use signup::{apply_status, SignupRecord, SignupState, SignupStatus, Transition};
pub use storage::{
    DataPoint, FileStore, MemoryStore, Storage, StorageError, SurveyResponseRecord,
};
pub use survey::{Commissioner, DecodeError, Query, SharedSurvey, Survey};
