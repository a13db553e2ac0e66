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

//! The small set of error kinds the orchestrator needs to pattern match
//! on in order to decide how to react (as opposed to merely logging and
//! giving up). Every other failure just flows through as an opaque
//! `anyhow::Error`.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// The user hit Ctrl-C or Ctrl-D while typing into a menu prompt.
    UserCancelled,
    /// A provider ran out of unused `<prefix>-<date>[a-z]` name slots.
    NoAvailableName(String),
    /// There are no providers configured (or none enabled) to offer.
    NoProvider(String),
    /// The client asked for a shell without ever requesting a pty.
    NoTty,
    /// Catch-all for failures that don't need their own match arm
    /// upstream but still need to flow through a `Result<_, Error>`.
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UserCancelled => write!(f, "user cancelled input"),
            Error::NoAvailableName(msg) => write!(f, "{}", msg),
            Error::NoProvider(msg) => write!(f, "{}", msg),
            Error::NoTty => write!(f, "client never allocated a pty"),
            Error::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}
