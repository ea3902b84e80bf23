// SPDX-License-Identifier: MIT

mod attr;
mod bss;
mod connection;
mod handle;
mod message;

pub use self::attr::Nl80211Attr;
pub use self::bss::Nl80211BssAttr;
pub use self::connection::{new_connection, Nl80211Events};
pub use self::handle::Nl80211Handle;
pub use self::message::{Nl80211Cmd, Nl80211Message};

/// Cipher suite selectors as they appear in NL80211_ATTR_KEY_CIPHER.
pub use crate::ies::{SUITE_CCMP, SUITE_TKIP};
