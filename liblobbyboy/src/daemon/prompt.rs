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

//! Line-edited input read one byte at a time off an ssh channel, plus
//! a numbered menu picker built on top of it.

use std::collections::VecDeque;

use russh::{server::Handle, ChannelId, CryptoVec};
use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::Error;

pub struct PromptReader<'a> {
    handle: Handle,
    channel_id: ChannelId,
    rx: &'a mut mpsc::UnboundedReceiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

impl<'a> PromptReader<'a> {
    pub fn new(handle: Handle, channel_id: ChannelId, rx: &'a mut mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        PromptReader { handle, channel_id, rx, pending: VecDeque::new() }
    }

    pub async fn send(&self, data: &[u8]) {
        if self.handle.data(self.channel_id, CryptoVec::from(data.to_vec())).await.is_err() {
            debug!("client went away while writing prompt output");
        }
    }

    async fn next_byte(&mut self) -> anyhow::Result<u8> {
        loop {
            if let Some(b) = self.pending.pop_front() {
                return Ok(b);
            }
            match self.rx.recv().await {
                Some(chunk) => self.pending.extend(chunk),
                None => anyhow::bail!("channel closed while reading input"),
            }
        }
    }

    /// Reads one line of input, honoring carriage return as the
    /// terminator, DEL as backspace-with-echo, and Ctrl-C/Ctrl-D as an
    /// immediate cancellation.
    pub async fn read_line(&mut self) -> Result<String, Error> {
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let b = self.next_byte().await.map_err(|_| Error::UserCancelled)?;
            match b {
                b'\r' => {
                    self.send(b"\r\n").await;
                    break;
                }
                0x7F => {
                    if buf.pop().is_some() {
                        self.send(b"\x08\x1b[K").await;
                    }
                }
                0x03 | 0x04 => return Err(Error::UserCancelled),
                _ => {
                    buf.push(b);
                    self.send(&[b]).await;
                }
            }
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Presents `options` as a numbered menu and returns the zero-based
    /// index the user picked, reprompting on anything out of range.
    pub async fn choose_option(
        &mut self,
        options: &[String],
        option_prompt: Option<&str>,
        ask_prompt: Option<&str>,
    ) -> Result<usize, Error> {
        if let Some(p) = option_prompt {
            self.send(format!("{}\r\n", p).as_bytes()).await;
        }
        for (index, option) in options.iter().enumerate() {
            self.send(format!("{:>3} - {}\r\n", index, option).as_bytes()).await;
        }
        let ask = ask_prompt.unwrap_or("Please enter the number of choice: ");

        loop {
            self.send(ask.as_bytes()).await;
            let line = self.read_line().await?;
            match line.trim().parse::<usize>() {
                Ok(idx) if idx < options.len() => return Ok(idx),
                _ => self.send(b"\r\nInvalid choice, please try again.\r\n").await,
            }
        }
    }
}
