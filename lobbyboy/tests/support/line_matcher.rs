use std::{io, io::BufRead, time};

use anyhow::{anyhow, Context};
use regex::Regex;

const READ_TIMEOUT: time::Duration = time::Duration::from_secs(15);
const READ_SLEEP: time::Duration = time::Duration::from_millis(20);

/// Scans a nonblocking child pipe line by line until a regex matches or
/// the read times out, same polling idiom used to assert on a
/// subprocess's stdout/stderr throughout this crate's integration tests.
pub struct LineMatcher<R: io::Read> {
    out: io::BufReader<R>,
}

impl<R: io::Read> LineMatcher<R> {
    pub fn new(reader: R) -> Self {
        LineMatcher { out: io::BufReader::new(reader) }
    }

    pub fn scan_until_re(&mut self, re: &str) -> anyhow::Result<String> {
        let compiled = Regex::new(re)?;
        let start = time::Instant::now();
        loop {
            let mut line = String::new();
            match self.out.read_line(&mut line) {
                Ok(0) => return Err(anyhow!("LineMatcher: EOF waiting for /{}/", re)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() > READ_TIMEOUT {
                        return Err(anyhow!("timed out waiting for /{}/", re));
                    }
                    std::thread::sleep(READ_SLEEP);
                    continue;
                }
                Err(e) => return Err(e).context("reading line from subprocess output"),
                Ok(_) => {}
            }

            let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
            if compiled.is_match(&trimmed) {
                return Ok(trimmed);
            }
        }
    }
}
