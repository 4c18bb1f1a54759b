//! Password resolution
//!
//! Instances may be configured without a password. Before a run starts every
//! blank password is resolved from `MSSQL_<USER>_PASSWORD`, or else by
//! prompting on the terminal. Each distinct user is prompted at most once per
//! run; answers live in the resolver, never in process-wide state.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::InstanceDescriptor;

/// Environment lookup: variable name to value
pub type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Interactive prompt: prompt text to answer
pub type PasswordPrompt = Box<dyn Fn(&str) -> std::io::Result<String> + Send + Sync>;

/// Resolves and caches passwords for one run
pub struct PasswordResolver {
    env: EnvLookup,
    prompt: PasswordPrompt,
    cache: Mutex<HashMap<String, String>>,
}

impl PasswordResolver {
    /// Resolver reading the process environment and prompting on the terminal
    pub fn new() -> Self {
        Self::with_sources(
            Box::new(|name| std::env::var(name).ok()),
            Box::new(|prompt| rpassword::prompt_password(prompt)),
        )
    }

    /// Resolver with custom environment and prompt sources
    pub fn with_sources(env: EnvLookup, prompt: PasswordPrompt) -> Self {
        Self {
            env,
            prompt,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Environment variable consulted for `user`
    pub fn env_var_name(user: &str) -> String {
        format!("MSSQL_{}_PASSWORD", user.trim().to_uppercase())
    }

    /// Resolve the password for `user`
    pub fn resolve(&self, user: &str) -> Result<String> {
        let user = user.trim();
        let mut cache = self.cache.lock();
        if let Some(password) = cache.get(user) {
            return Ok(password.clone());
        }

        let var = Self::env_var_name(user);
        let password = match (self.env)(&var).filter(|v| !v.is_empty()) {
            Some(password) => {
                debug!(user = %user, variable = %var, "Password taken from environment");
                password
            }
            None => {
                let prompt = format!("Type password for account {}: ", user);
                (self.prompt)(&prompt).map_err(|e| {
                    Error::Credentials(format!("cannot read password for {}: {}", user, e))
                })?
            }
        };

        cache.insert(user.to_string(), password.clone());
        Ok(password)
    }

    /// Fill every blank password in `instances`
    ///
    /// Returns the number of instances that were updated.
    pub fn resolve_all(&self, instances: &mut [InstanceDescriptor]) -> Result<usize> {
        let mut resolved = 0;
        for instance in instances.iter_mut() {
            if !instance.credentials.needs_password() {
                continue;
            }
            instance.credentials.password = self.resolve(&instance.credentials.username)?;
            resolved += 1;
        }
        if resolved > 0 {
            info!(
                instances = resolved,
                users = self.cache.lock().len(),
                "Resolved instance passwords"
            );
        }
        Ok(resolved)
    }
}

impl Default for PasswordResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Credentials, InstanceAddress};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn resolver_with(
        env: HashMap<String, String>,
        answer: &'static str,
    ) -> (PasswordResolver, Arc<AtomicUsize>) {
        let prompts = Arc::new(AtomicUsize::new(0));
        let counter = prompts.clone();
        let resolver = PasswordResolver::with_sources(
            Box::new(move |name| env.get(name).cloned()),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(answer.to_string())
            }),
        );
        (resolver, prompts)
    }

    fn instance(ci: &str, user: &str, password: &str) -> InstanceDescriptor {
        InstanceDescriptor::new(
            ci,
            InstanceAddress::with_port("h", 1433),
            Credentials::new(user, password),
        )
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(
            PasswordResolver::env_var_name(" monitor "),
            "MSSQL_MONITOR_PASSWORD"
        );
    }

    #[test]
    fn test_environment_wins_over_prompt() {
        let mut env = HashMap::new();
        env.insert("MSSQL_MONITOR_PASSWORD".to_string(), "from-env".to_string());
        let (resolver, prompts) = resolver_with(env, "typed");

        assert_eq!(resolver.resolve("monitor").unwrap(), "from-env");
        assert_eq!(prompts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_env_value_falls_back_to_prompt() {
        let mut env = HashMap::new();
        env.insert("MSSQL_MONITOR_PASSWORD".to_string(), String::new());
        let (resolver, prompts) = resolver_with(env, "typed");

        assert_eq!(resolver.resolve("monitor").unwrap(), "typed");
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prompt_once_per_user() {
        let (resolver, prompts) = resolver_with(HashMap::new(), "typed");
        let mut instances = vec![
            instance("CI1", "monitor", ""),
            instance("CI2", "monitor", ""),
            instance("CI3", "other", ""),
            instance("CI4", "preset", "already"),
        ];

        let resolved = resolver.resolve_all(&mut instances).unwrap();

        assert_eq!(resolved, 3);
        assert_eq!(prompts.load(Ordering::SeqCst), 2);
        assert_eq!(instances[0].credentials.password, "typed");
        assert_eq!(instances[1].credentials.password, "typed");
        assert_eq!(instances[3].credentials.password, "already");
    }

    #[test]
    fn test_prompt_failure_is_reported() {
        let resolver = PasswordResolver::with_sources(
            Box::new(|_| None),
            Box::new(|_| Err(std::io::Error::new(std::io::ErrorKind::Other, "no tty"))),
        );
        let err = resolver.resolve("monitor").unwrap_err();
        assert!(matches!(err, Error::Credentials(_)));
        assert!(err.to_string().contains("no tty"));
    }
}
