// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! CoAP option numbers and iteration over encoded option lists.

use super::*;

mod num;
pub use num::*;

mod iter;
pub use iter::*;

mod insert;
pub use insert::*;

/// The largest option value length this implementation will encode or
/// accept, per the RFC 7252 §5.10 option registry.
pub const MAX_OPTION_VALUE_SIZE: usize = 1034;
