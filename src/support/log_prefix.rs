//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Stowbox.
//
// Stowbox is free software: you can redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Stowbox is distributed in the hope that it  will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Stowbox. If not, see <http://www.gnu.org/licenses/>.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// concerning a storage instance or one of its mailboxes.
///
/// Clones of a `LogPrefix` share the same underlying data; use `mailbox()` to
/// derive an independent prefix for a mailbox handle.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    context: String,
    mailbox: Option<String>,
}

impl LogPrefix {
    pub fn new(context: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                context: sanitise(context),
                mailbox: None,
            })),
        }
    }

    /// Create a new, independent prefix with the same context that names
    /// `mailbox`.
    pub fn mailbox(&self, mailbox: &str) -> Self {
        let inner = self.lock();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                context: inner.context.clone(),
                mailbox: Some(sanitise(mailbox.to_owned())),
            })),
        }
    }

    pub fn set_context(&self, context: String) {
        self.lock().context = sanitise(context);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned prefix is still perfectly usable for logging
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.lock();
        write!(f, "{}", inner.context)?;
        if let Some(ref mailbox) = inner.mailbox {
            write!(f, ":{}", mailbox)?;
        }
        Ok(())
    }
}

impl fmt::Debug for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <LogPrefix as fmt::Display>::fmt(self, f)
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}
