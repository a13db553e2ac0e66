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
/// lobbyboy is an ssh gateway that authenticates incoming connections,
/// provisions or reuses a backend cloud server per user, and proxies
/// the resulting shell session. See the README for more info.
use clap::Parser;

fn main() -> anyhow::Result<()> {
    let args = liblobbyboy::Args::parse();
    liblobbyboy::run(args)
}
