// Copyright Istio Authors
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

use arcstr::ArcStr;

/// Strng is a cheaply cloneable, immutable string. Names of services, proxies and resources are
/// cloned into every generated response, so we avoid re-allocating them.
pub type Strng = ArcStr;

pub const EMPTY: Strng = arcstr::literal!("");

pub fn new<A: AsRef<str>>(s: A) -> Strng {
    ArcStr::from(s.as_ref())
}

pub use arcstr::literal;
