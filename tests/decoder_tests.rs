//! Integration tests for decoding trace logs from files and readers

use modscope::config::{Config, DecoderConfig};
use modscope::decoder::{self, CallRecord, Decoder, DecoderError, ModuleDenylist};
use std::io::Write;

fn write_log(lines: &[&str]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
    file.flush().unwrap();
    file
}

#[test]
fn test_decode_file_end_to_end() {
    let log = write_log(&["0 A", "0 B", "1 0 1", "3 50", "2 0", "3 100", "2 0"]);
    let timeline = decoder::decode_file(log.path(), &DecoderConfig::default()).unwrap();

    assert_eq!(timeline.modules, vec!["A", "B"]);
    assert_eq!(timeline.callsites, vec![(0, 1)]);
    assert_eq!(
        timeline.calls,
        vec![CallRecord {
            when: 100,
            callsite: 0,
            count: 2
        }]
    );
}

#[test]
fn test_decode_is_deterministic() {
    let log = write_log(&[
        "0 app.main",
        "0 app.db",
        "0 app.cache",
        "1 0 1",
        "1 0 2",
        "2 0",
        "2 1",
        "3 40",
        "2 1",
        "9 warmup done",
        "3 700",
        "2 0",
        "12 0 300 query",
        "5 1048576",
        "4 3.5 20.0",
    ]);
    let config = DecoderConfig::default();
    let first = decoder::decode_file(log.path(), &config).unwrap();
    let second = decoder::decode_file(log.path(), &config).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
}

#[test]
fn test_decode_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = decoder::decode_file(&dir.path().join("absent.txt"), &DecoderConfig::default())
        .unwrap_err();
    assert!(matches!(err, DecoderError::Io(_)));
}

#[test]
fn test_decode_source_dispatches_on_scheme() {
    let log = write_log(&["0 A"]);
    let path = log.path().to_string_lossy().into_owned();
    let timeline = decoder::decode_source(&path, &DecoderConfig::default()).unwrap();
    assert_eq!(timeline.modules, vec!["A"]);

    // Nothing listens on port 1
    let err = decoder::decode_source("http://127.0.0.1:1/trace", &DecoderConfig::default())
        .unwrap_err();
    assert!(matches!(err, DecoderError::Fetch(_)));
}

#[test]
fn test_malformed_lines_do_not_abort() {
    let log = write_log(&[
        "0 A",
        "0 B",
        "1 0 1",
        "not a line",
        "99 unknown tag",
        "2 7",
        "1 0",
        "3 20",
        "2 0",
    ]);
    let timeline = decoder::decode_file(log.path(), &DecoderConfig::default()).unwrap();
    assert_eq!(timeline.malformed_lines, 4);
    assert_eq!(timeline.calls.len(), 1);
    assert_eq!(timeline.calls[0].when, 20);
}

#[test]
fn test_custom_gap_from_config() {
    let config = Config::from_toml_str("[decoder]\ncoalesce_gap_ms = 50\n").unwrap();
    let log = write_log(&["0 A", "0 B", "1 0 1", "2 0", "3 40", "2 0", "3 100", "2 0"]);
    let timeline = decoder::decode_file(log.path(), &config.decoder).unwrap();
    let counts: Vec<_> = timeline.calls.iter().map(|c| (c.when, c.count)).collect();
    assert_eq!(counts, vec![(40, 2), (100, 1)]);
}

#[test]
fn test_custom_denylist_from_config() {
    let config = Config::from_toml_str("[decoder]\ndenylist = [\"^vendor\\\\.\"]\n").unwrap();
    let log = write_log(&[
        "0 app",
        "0 vendor.http",
        "0 runpy",
        "1 0 1",
        "1 2 0",
        "2 0",
        "2 1",
    ]);
    let timeline = decoder::decode_file(log.path(), &config.decoder).unwrap();
    // Only the configured pattern applies; runpy is no longer filtered
    let callsites: Vec<_> = timeline.calls.iter().map(|c| c.callsite).collect();
    assert_eq!(callsites, vec![1]);
}

#[test]
fn test_runs_flushed_in_time_order() {
    let mut decoder = Decoder::with_denylist(500, ModuleDenylist::empty());
    for line in [
        "0 A", "0 B", "0 C", "1 0 1", "1 0 2", "3 10", "2 1", "3 20", "2 0", "3 30", "2 1",
    ] {
        decoder.parse_line(line).unwrap();
    }
    let timeline = decoder.finish();
    assert_eq!(
        timeline.calls,
        vec![
            CallRecord {
                when: 20,
                callsite: 0,
                count: 1
            },
            CallRecord {
                when: 30,
                callsite: 1,
                count: 2
            },
        ]
    );
}

#[test]
fn test_hotspot_start_saturates() {
    let mut decoder = Decoder::with_denylist(500, ModuleDenylist::empty());
    for line in ["0 A", "0 B", "1 0 1", "3 50", "12 0 200 slow path"] {
        decoder.parse_line(line).unwrap();
    }
    let timeline = decoder.finish();
    assert_eq!(timeline.hotspots[0].start, 0);
    assert_eq!(timeline.hotspots[0].label, "slow path");
}
