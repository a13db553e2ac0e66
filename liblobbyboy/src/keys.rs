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

//! Key material management: the lobby's own ssh host key, offered to
//! every inbound connection, and the per-server key pairs minted for
//! backend servers so that a freshly created vm can be reached without
//! a password.

use std::{fs, os::unix::fs::PermissionsExt, path::Path};

use anyhow::Context;
use russh_keys::key::KeyPair;
use tracing::info;

use crate::consts::{DEFAULT_KEY_BITS, PRIVATE_KEY_BASENAME};

/// Loads the lobby host key from `data_dir/.ssh/id_rsa`, generating a
/// fresh RSA key pair there the first time lobbyboy starts up against
/// this data_dir.
pub fn host_key(data_dir: &Path) -> anyhow::Result<KeyPair> {
    let ssh_dir = data_dir.join(".ssh");
    confirm_key_pair(&ssh_dir)
}

/// Ensures a private/public key pair exists under `dir/id_rsa` (and
/// `dir/id_rsa.pub`), generating one if absent, and returns the loaded
/// key pair either way. Used both for the lobby's own host key and for
/// the per-server key pairs a provider drops into a server's workspace.
pub fn confirm_key_pair(dir: &Path) -> anyhow::Result<KeyPair> {
    fs::create_dir_all(dir).with_context(|| format!("creating key directory {:?}", dir))?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("chmod 0700 {:?}", dir))?;
    let priv_path = dir.join(PRIVATE_KEY_BASENAME);
    let pub_path = dir.join(format!("{}.pub", PRIVATE_KEY_BASENAME));

    if priv_path.exists() {
        return russh_keys::load_secret_key(&priv_path, None)
            .with_context(|| format!("loading existing key pair at {:?}", priv_path));
    }

    info!(dir = %dir.display(), "generating new ssh key pair");
    let key_pair =
        KeyPair::generate_rsa(DEFAULT_KEY_BITS, russh_keys::key::SignatureHash::SHA2_256)
            .context("generating rsa key pair")?;

    let mut priv_file = fs::File::create(&priv_path)
        .with_context(|| format!("creating private key file {:?}", priv_path))?;
    russh_keys::encode_pkcs8_pem(&key_pair, &mut priv_file)
        .with_context(|| format!("writing private key to {:?}", priv_path))?;
    fs::set_permissions(&priv_path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("chmod 0600 {:?}", priv_path))?;

    let public_line = format!(
        "{} {}\n",
        key_pair.clone_public_key()?.name(),
        russh_keys::PublicKeyBase64::public_key_base64(&key_pair.clone_public_key()?)
    );
    fs::write(&pub_path, public_line).with_context(|| format!("writing public key to {:?}", pub_path))?;

    Ok(key_pair)
}

/// Returns the `authorized_keys`-format line for the public half of a
/// key pair so it can be appended to a freshly created backend server.
pub fn public_key_line(key_pair: &KeyPair) -> anyhow::Result<String> {
    let public = key_pair.clone_public_key()?;
    Ok(format!(
        "{} {}",
        public.name(),
        russh_keys::PublicKeyBase64::public_key_base64(&public)
    ))
}
