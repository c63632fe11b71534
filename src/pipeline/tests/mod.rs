use super::test_helpers::*;
use crate::config::MergeMode;
use crate::error::{Error, MergeError};
use crate::types::{EncoderClass, Event, SourceDescriptor, Stage, Status};
use crate::workers::EncoderProfile;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

mod cache;

const URL_A: &str = "https://www.youtube.com/watch?v=aaaaaaaaaaa";
const URL_B: &str = "https://youtu.be/bbbbbbbbbbb";
const URL_C: &str = "https://youtu.be/ccccccccccc";

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

fn output_in(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("out").join("merged.mp4")
}
