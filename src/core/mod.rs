// Copyright (c) 2026 Dispersy
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Protocol core: policies, messages, codec, and the community pipeline.

pub mod batch;
pub mod bloom;
pub mod codec;
pub mod community;
pub mod delay;
pub mod identity;
pub mod member;
pub mod message;
pub mod payload;
pub mod policy;
pub mod sequence;
pub mod signer;
pub mod sync;
pub mod types;
