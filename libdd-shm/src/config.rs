// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::backend::BackendKind;

pub const DD_SHM_BACKEND: &str = "DD_SHM_BACKEND";
pub const DD_SHM_KEY_LENGTH: &str = "DD_SHM_KEY_LENGTH";
pub const DD_SHM_PROJECT_ID: &str = "DD_SHM_PROJECT_ID";

pub const DEFAULT_KEY_LENGTH: usize = 32;
pub const DEFAULT_PROJECT_ID: i32 = 42;

pub mod parse_env {
    use std::{env, str::FromStr};

    pub fn int<T: FromStr>(name: &str) -> Option<T> {
        env::var(name).ok()?.parse::<T>().ok()
    }

    pub fn str_not_empty(name: &str) -> Option<String> {
        env::var(name).ok().filter(|s| !s.is_empty())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShmConfig {
    /// Backend used for every segment created through this configuration.
    pub backend: BackendKind,
    /// Key buffer capacity handed to `generate_key`, terminator included.
    pub key_length: usize,
    /// Project id mixed into token keys.
    pub project_id: i32,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            key_length: DEFAULT_KEY_LENGTH,
            project_id: DEFAULT_PROJECT_ID,
        }
    }
}

impl ShmConfig {
    pub fn from_env() -> Self {
        let backend = match parse_env::str_not_empty(DD_SHM_BACKEND) {
            Some(raw) => raw.parse().unwrap_or_else(|err| {
                tracing::warn!("{err} in {DD_SHM_BACKEND}, using the default backend");
                BackendKind::default()
            }),
            None => BackendKind::default(),
        };
        let key_length = parse_env::int::<usize>(DD_SHM_KEY_LENGTH)
            .filter(|len| *len > 1)
            .unwrap_or(DEFAULT_KEY_LENGTH);
        let project_id = parse_env::int(DD_SHM_PROJECT_ID).unwrap_or(DEFAULT_PROJECT_ID);

        Self {
            backend,
            key_length,
            project_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear() {
        env::remove_var(DD_SHM_BACKEND);
        env::remove_var(DD_SHM_KEY_LENGTH);
        env::remove_var(DD_SHM_PROJECT_ID);
    }

    #[test]
    #[serial]
    fn defaults_without_env() {
        clear();
        assert_eq!(ShmConfig::default(), ShmConfig::from_env());
    }

    #[test]
    #[serial]
    fn reads_env() {
        clear();
        env::set_var(DD_SHM_BACKEND, "sysv");
        env::set_var(DD_SHM_KEY_LENGTH, "16");
        env::set_var(DD_SHM_PROJECT_ID, "7");
        let config = ShmConfig::from_env();
        clear();

        assert_eq!(BackendKind::SystemV, config.backend);
        assert_eq!(16, config.key_length);
        assert_eq!(7, config.project_id);
    }

    #[test]
    #[serial]
    fn bad_values_fall_back() {
        clear();
        env::set_var(DD_SHM_BACKEND, "carrier-pigeon");
        env::set_var(DD_SHM_KEY_LENGTH, "0");
        env::set_var(DD_SHM_PROJECT_ID, "not a number");
        let config = ShmConfig::from_env();
        clear();

        assert_eq!(ShmConfig::default(), config);
    }
}
