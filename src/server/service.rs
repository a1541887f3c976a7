//! Command execution against the counter store.

use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::error::{FloodgateError, Result};
use crate::protocol::{Command, Reply};
use crate::ratelimit::CounterStore;

/// Executes decoded commands for every connection.
#[derive(Debug, Clone)]
pub struct CommandService {
    store: Arc<CounterStore>,
}

impl CommandService {
    pub fn new(store: Arc<CounterStore>) -> Self {
        Self { store }
    }

    /// Run one command.
    ///
    /// Invalid arguments come back as protocol errors.
    #[instrument(skip(self, command), fields(command = command.name()))]
    pub async fn execute(&self, command: Command) -> Result<Reply> {
        match command {
            Command::Limit { ip, groups } => {
                if ip.is_empty() {
                    warn!("Received limit command with empty identity");
                    return Err(FloodgateError::Protocol("ip is required".to_string()));
                }
                if groups.is_empty() {
                    warn!("Received limit command with no groups");
                    return Err(FloodgateError::Protocol(
                        "at least one group is required".to_string(),
                    ));
                }
                for policy in &groups {
                    policy
                        .validate()
                        .map_err(|e| FloodgateError::Protocol(e.to_string()))?;
                }

                let decision = self.store.limit(&ip, &groups).await?;
                debug!(
                    ip = %ip,
                    groups = groups.len(),
                    allowed = decision.is_allowed(),
                    "Rate limit decision made"
                );
                Ok(Reply::Limit {
                    response: decision.reset_millis(),
                })
            }
            Command::Reset { group } => {
                if group.is_empty() {
                    return Ok(Reply::Reset {
                        error: Some("group is required".to_string()),
                    });
                }
                self.store.reset(&group);
                Ok(Reply::Reset { error: None })
            }
            Command::ResetAll => {
                self.store.reset_all();
                Ok(Reply::ResetAll { error: None })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Policy;

    fn limit(ip: &str, groups: Vec<Policy>) -> Command {
        Command::Limit {
            ip: ip.to_string(),
            groups,
        }
    }

    #[tokio::test]
    async fn test_empty_identity_rejected() {
        let service = CommandService::new(Arc::new(CounterStore::new()));
        let result = service
            .execute(limit("", vec![Policy::new("g", 1, 60).unwrap()]))
            .await;
        assert!(matches!(result, Err(FloodgateError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_empty_groups_rejected() {
        let service = CommandService::new(Arc::new(CounterStore::new()));
        let result = service.execute(limit("1.2.3.4", vec![])).await;
        assert!(matches!(result, Err(FloodgateError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_invalid_policy_rejected() {
        let service = CommandService::new(Arc::new(CounterStore::new()));
        let bad = Policy {
            group: "g".to_string(),
            limit: 0,
            interval: 60,
        };
        let result = service.execute(limit("1.2.3.4", vec![bad])).await;
        assert!(matches!(result, Err(FloodgateError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_limit_then_reset() {
        let store = Arc::new(CounterStore::new());
        let service = CommandService::new(store.clone());
        let groups = vec![Policy::new("login", 1, 60).unwrap()];

        let reply = service.execute(limit("ip", groups.clone())).await.unwrap();
        assert_eq!(reply, Reply::Limit { response: None });

        let reply = service.execute(limit("ip", groups.clone())).await.unwrap();
        let expiration = store.counter("login", "ip").unwrap().expiration;
        assert_eq!(
            reply,
            Reply::Limit {
                response: Some(expiration.timestamp_millis())
            }
        );

        let reply = service
            .execute(Command::Reset {
                group: "login".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(reply, Reply::Reset { error: None });

        let reply = service.execute(limit("ip", groups)).await.unwrap();
        assert_eq!(reply, Reply::Limit { response: None });
    }

    #[tokio::test]
    async fn test_reset_without_group_reports_error() {
        let service = CommandService::new(Arc::new(CounterStore::new()));
        let reply = service
            .execute(Command::Reset {
                group: String::new(),
            })
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Reset { error: Some(_) }));
    }

    #[tokio::test]
    async fn test_reset_all() {
        let store = Arc::new(CounterStore::new());
        let service = CommandService::new(store.clone());
        service
            .execute(limit("ip", vec![Policy::new("a", 5, 60).unwrap()]))
            .await
            .unwrap();

        let reply = service.execute(Command::ResetAll).await.unwrap();
        assert_eq!(reply, Reply::ResetAll { error: None });
        assert_eq!(store.counter("a", "ip").unwrap().count, 0);
    }
}
