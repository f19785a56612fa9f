#![allow(dead_code)]

use std::error::Error;

pub use taskgov_test_utils::builders::{
    ConfigFileBuilder, SubmissionBuilder, TaskSpecBuilder, o, t,
};
pub use taskgov_test_utils::harness::ClusterHarness;
pub use taskgov_test_utils::recording_backend::{Recorded, RecordingBackend};
pub use taskgov_test_utils::{init_tracing, with_timeout};

pub type TestResult = Result<(), Box<dyn Error>>;
