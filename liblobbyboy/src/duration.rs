// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/*! A parser for the duration format used throughout the config file:
  reaper intervals, min_life_to_live, bill_time_unit and destroy_safe_time.
*/

use std::time;

use anyhow::{anyhow, bail};

/// Parses a duration literal of the form `<digits><unit>` where unit is
/// one of `s`, `m`, `h`, `d`, or the special sentinel `"0"` (no unit,
/// meaning "zero seconds").
pub fn parse(src: &str) -> anyhow::Result<time::Duration> {
    if src == "0" {
        return Ok(time::Duration::from_secs(0));
    }

    let unit = src.chars().last().ok_or_else(|| anyhow!("empty duration"))?;
    if !unit.is_alphabetic() {
        bail!("could not parse '{}' as duration, expected a trailing s/m/h/d unit", src);
    }
    let num_part = &src[..src.len() - unit.len_utf8()];
    if num_part.is_empty() || !num_part.bytes().all(|b| b.is_ascii_digit()) {
        bail!("could not parse '{}' as duration, expected digits before the unit", src);
    }
    let num: u64 = num_part.parse().map_err(|_| anyhow!("duration '{}' overflows u64", src))?;

    let secs = match unit {
        's' => num,
        'm' => num * 60,
        'h' => num * 60 * 60,
        'd' => num * 60 * 60 * 24,
        _ => bail!("unknown duration unit '{}' in '{}'", unit, src),
    };
    Ok(time::Duration::from_secs(secs))
}

/// Coarsely formats a duration for a human reading a status line sent
/// down an ssh channel, e.g. "3 minutes", "2 hours".
pub fn humanize(d: time::Duration) -> String {
    let seconds = d.as_secs();
    if seconds <= 60 {
        return format!("{} seconds", seconds);
    }
    let minutes = seconds / 60;
    if minutes <= 60 {
        return format!("{} minutes", minutes);
    }
    let hours = minutes / 60;
    if hours <= 24 {
        return format!("{} hours", hours);
    }
    let days = hours / 24;
    format!("{} days", days)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn successes() {
        let cases = vec![
            ("0", time::Duration::from_secs(0)),
            ("5s", time::Duration::from_secs(5)),
            ("5m", time::Duration::from_secs(5 * 60)),
            ("5h", time::Duration::from_secs(5 * 60 * 60)),
            ("5d", time::Duration::from_secs(5 * 60 * 60 * 24)),
        ];

        for (src, dur) in cases.into_iter() {
            match parse(src) {
                Ok(parsed_dur) => assert_eq!(dur, parsed_dur),
                Err(e) => panic!("unexpected error parsing '{}': {}", src, e),
            }
        }
    }

    #[test]
    fn errors() {
        let cases = vec!["12", "12x", "", "-5s", "5"];

        for src in cases.into_iter() {
            assert!(parse(src).is_err(), "expected '{}' to fail to parse", src);
        }
    }

    #[test]
    fn humanize_buckets() {
        assert_eq!(humanize(time::Duration::from_secs(30)), "30 seconds");
        assert_eq!(humanize(time::Duration::from_secs(5 * 60)), "5 minutes");
        assert_eq!(humanize(time::Duration::from_secs(3 * 60 * 60)), "3 hours");
        assert_eq!(humanize(time::Duration::from_secs(2 * 24 * 60 * 60)), "2 days");
    }
}
