// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Tracing setup for binaries and demos.
//!
//! Logs go to stderr so stdout stays free for report output. `RUST_LOG`
//! overrides the level passed in.

use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt};

/// Installs the global subscriber.
///
/// # Arguments
/// * `level` - Default filter, e.g. `"info"` or `"groomer_settlement=debug"`
/// * `json_format` - One JSON object per event instead of human-readable lines
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logger(level: &str, json_format: bool) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(env_filter);

    if json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    }
}
