use std::fs;
use std::time::Duration;

use crate::config::Settings;
use crate::logpipe::{LogPipeline, PipelineState};
use crate::net::configure;
use crate::segment::{segment_size, segment_size_str, split};

#[test]
fn plan_accounting_matches_file_size() {
    let mut settings = Settings::default();
    settings.segment_size = 64 * 1024;
    settings.max_connections = 6;
    let file_size = 1_000_003u64;

    let ranges = settings.plan(file_size);
    assert_eq!(ranges.len(), 6);
    let total: u64 = ranges.iter().flatten().map(segment_size).sum();
    assert_eq!(total, file_size);

    // progress displays work from the textual form as well
    let total_from_text: u64 = ranges
        .iter()
        .flatten()
        .map(|range| segment_size_str(&range.to_string()))
        .sum();
    assert_eq!(total_from_text, file_size);
}

#[test]
fn split_and_plan_agree_on_coverage() {
    let file_size = 10_000u64;
    let chunks = split(file_size, 2_500);
    let planned: Vec<_> = crate::segment::plan(file_size, 2_500, 16)
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(chunks, planned);
}

#[test]
fn every_request_shares_settings_policy() {
    let mut settings = Settings::default();
    settings.proxy = "http://10.0.0.1:8080".to_string();
    settings.username = "alice".to_string();
    let options = settings.request_options();

    let mut overrides = crate::net::HeaderMapping::new();
    overrides.insert("Range".to_string(), "bytes=0-99".to_string());
    for config in [configure(&options, None), configure(&options, Some(&overrides))] {
        assert_eq!(config.proxy, "http://10.0.0.1:8080");
        assert_eq!(config.max_redirects, 10);
        assert_eq!(
            config.credentials,
            Some(("alice".to_string(), String::new()))
        );
    }
}

#[test]
fn pipeline_writes_to_settings_log_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut settings = Settings::default();
    settings.settings_folder = dir.path().to_path_buf();

    let mut pipeline = LogPipeline::to_file(settings.log_file())
        .with_interval(Duration::from_millis(10))
        .with_level(settings.log_level);
    pipeline.start().expect("start");
    let handle = pipeline.handle();
    handle.log("download started");
    handle.log_at(settings.log_level + 1, "too chatty");
    pipeline.shutdown();

    assert_eq!(pipeline.state(), PipelineState::Stopped);
    let text = fs::read_to_string(dir.path().join("log.txt")).expect("read log");
    assert_eq!(text, ">> download started\n");
}
