// Copyright 2025 jonefeewang@gmail.com
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

use bytes::Bytes;

use crate::AppResult;

/// Hook for payload encryption.
///
/// A frame only carries an optional encryption tag; what the tag means is up
/// to the implementation. No cipher ships with the crate.
pub trait PayloadCipher: Send + Sync {
    fn encrypt(&self, tag: u8, payload: &[u8]) -> AppResult<Bytes>;
    fn decrypt(&self, tag: u8, payload: &[u8]) -> AppResult<Bytes>;
}
