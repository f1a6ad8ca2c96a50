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

use std::fmt::Write as _;

use chrono::prelude::*;

/// A wall-clock reading with microsecond precision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub secs: i64,
    pub usecs: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = Utc::now();
        Timestamp {
            secs: now.timestamp(),
            usecs: now.timestamp_subsec_micros(),
        }
    }
}

/// Generates base names for new message files.
///
/// Names have the form `<secs>.P<pid>Q<counter>[M<usecs>].<host>`. The counter
/// increases on every call, so two names from the same generator never
/// collide even if the clock stands still or goes backwards; the pid and host
/// separate generators in different processes.
///
/// There should be one generator per process, shared by everything that
/// creates message files.
pub struct UniqueNameGenerator {
    pid: u32,
    host: String,
    counter: u64,
    last_secs: Option<i64>,
    clock: Box<dyn FnMut() -> Timestamp + Send>,
}

impl UniqueNameGenerator {
    /// Create a generator for the current process, using the system clock.
    pub fn new() -> Self {
        let host = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_owned());

        Self::with_state(
            nix::unistd::getpid().as_raw() as u32,
            &host,
            0,
            Box::new(Timestamp::now),
        )
    }

    /// Create a generator with explicit identity and starting state.
    pub fn with_state(
        pid: u32,
        host: &str,
        counter: u64,
        clock: Box<dyn FnMut() -> Timestamp + Send>,
    ) -> Self {
        UniqueNameGenerator {
            pid,
            host: sanitise_host(host),
            counter,
            last_secs: None,
            clock,
        }
    }

    pub fn generate(&mut self) -> String {
        let now = (self.clock)();
        self.counter += 1;

        let mut name = format!("{}.P{}Q{}", now.secs, self.pid, self.counter);
        // Microseconds are only needed to tell apart names minted within the
        // same second.
        if self.last_secs.map_or(false, |last| now.secs <= last) {
            let _ = write!(name, "M{}", now.usecs);
        }
        name.push('.');
        name.push_str(&self.host);

        self.last_secs = Some(now.secs);
        name
    }
}

impl Default for UniqueNameGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Escape the characters that have meaning in maildir file names (and `/`).
fn sanitise_host(host: &str) -> String {
    let mut out = String::with_capacity(host.len());
    for ch in host.chars() {
        match ch {
            '/' => out.push_str("\\057"),
            ':' => out.push_str("\\072"),
            ',' => out.push_str("\\054"),
            ch => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    fn fixed_clock(
        secs: i64,
        usecs: u32,
    ) -> Box<dyn FnMut() -> Timestamp + Send> {
        Box::new(move || Timestamp { secs, usecs })
    }

    #[test]
    fn same_second_names_are_distinct() {
        let mut gen = UniqueNameGenerator::with_state(
            42,
            "mx.example.com",
            0,
            fixed_clock(1_600_000_000, 17),
        );

        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(gen.generate()));
        }
    }

    #[test]
    fn name_format() {
        let mut gen = UniqueNameGenerator::with_state(
            42,
            "mx/a:b,c",
            7,
            fixed_clock(1_600_000_000, 17),
        );

        assert_eq!(
            "1600000000.P42Q8.mx\\057a\\072b\\054c",
            gen.generate()
        );
        // Same second, so microseconds are included
        assert_eq!(
            "1600000000.P42Q9M17.mx\\057a\\072b\\054c",
            gen.generate()
        );
    }

    #[test]
    fn microseconds_dropped_when_clock_advances() {
        let mut secs = 100;
        let mut gen = UniqueNameGenerator::with_state(
            1,
            "h",
            0,
            Box::new(move || {
                secs += 1;
                Timestamp { secs, usecs: 5 }
            }),
        );

        assert_eq!("101.P1Q1.h", gen.generate());
        assert_eq!("102.P1Q2.h", gen.generate());
    }

    #[test]
    fn system_generator_produces_safe_names() {
        let mut gen = UniqueNameGenerator::new();
        let a = gen.generate();
        let b = gen.generate();
        assert_ne!(a, b);
        assert!(!a.contains('/'));
        assert!(!a.contains(':'));
        assert!(!a.contains(','));
    }

    proptest! {
        #[test]
        fn unique_under_arbitrary_clock(
            readings in proptest::collection::vec(
                (0i64..4, 0u32..3), 1..200),
        ) {
            let mut readings = readings.into_iter();
            let mut gen = UniqueNameGenerator::with_state(
                9,
                "host",
                0,
                Box::new(move || {
                    let (secs, usecs) = readings.next().unwrap_or((0, 0));
                    Timestamp { secs, usecs }
                }),
            );

            let mut seen = HashSet::new();
            for _ in 0..200 {
                prop_assert!(seen.insert(gen.generate()));
            }
        }
    }
}
