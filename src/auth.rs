use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::debug;

use crate::config::{AuthStrategy, ChannelStrategy, ADMIN_GROUP};
use crate::jobs::Request;

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("user is not allowed to run the command")]
    UserNotAllowed,
    #[error("the command can not be used in this channel")]
    ChannelNotAllowed,
}

/// The authorization rules a command carries, evaluated against the current
/// group snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Policy<'a> {
    pub auth_strategy: AuthStrategy,
    pub allowed_groups: &'a [String],
    pub channel_strategy: ChannelStrategy,
    pub allowed_channels: &'a [String],
}

type GroupMap = HashMap<String, HashSet<String>>;

/// Group membership and the authorization checks built on it.
///
/// The group map is an immutable snapshot behind a read/write lock; reload
/// builds a complete replacement and swaps it in, so readers never observe a
/// half-applied map.
pub struct Authorizer {
    groups: RwLock<Arc<GroupMap>>,
}

impl Authorizer {
    pub fn new(groups: &HashMap<String, Vec<String>>) -> Authorizer {
        Authorizer {
            groups: RwLock::new(Arc::new(build_map(groups))),
        }
    }

    /// Replaces the group map wholesale.
    pub fn reload(&self, groups: &HashMap<String, Vec<String>>) {
        let map = Arc::new(build_map(groups));
        *self.groups.write().expect("groups lock poisoned") = map;
    }

    fn snapshot(&self) -> Arc<GroupMap> {
        self.groups.read().expect("groups lock poisoned").clone()
    }

    pub fn is_member(&self, group: &str, username: &str) -> bool {
        self.snapshot()
            .get(group)
            .map(|members| members.contains(username))
            .unwrap_or(false)
    }

    pub fn is_admin(&self, username: &str) -> bool {
        self.is_member(ADMIN_GROUP, username)
    }

    /// Whether the username appears in any configured group.
    pub fn is_known_user(&self, username: &str) -> bool {
        self.snapshot()
            .values()
            .any(|members| members.contains(username))
    }

    /// Sorted view of the group map, for the `groups` built-in.
    pub fn list(&self) -> BTreeMap<String, Vec<String>> {
        self.snapshot()
            .iter()
            .map(|(group, members)| {
                let mut members: Vec<String> = members.iter().cloned().collect();
                members.sort();
                (group.clone(), members)
            })
            .collect()
    }

    /// Evaluates both the authorization strategy and the channel policy.
    /// Both must pass for the request to be accepted.
    pub fn check(&self, request: &Request, policy: Policy<'_>) -> Result<(), AuthError> {
        self.check_user(request, policy)?;
        self.check_channel(request, policy)
    }

    fn check_user(&self, request: &Request, policy: Policy<'_>) -> Result<(), AuthError> {
        let allowed = match policy.auth_strategy {
            AuthStrategy::Any => true,
            AuthStrategy::None => self.is_admin(&request.username),
            AuthStrategy::Group => policy
                .allowed_groups
                .iter()
                .any(|group| self.is_member(group, &request.username)),
        };
        if !allowed {
            debug!(
                "user {} denied command {} by strategy {}",
                request.username,
                request.command,
                policy.auth_strategy.as_str()
            );
            return Err(AuthError::UserNotAllowed);
        }
        Ok(())
    }

    fn check_channel(&self, request: &Request, policy: Policy<'_>) -> Result<(), AuthError> {
        match policy.channel_strategy {
            ChannelStrategy::Any => Ok(()),
            ChannelStrategy::Allowed => {
                if request.is_im
                    || policy
                        .allowed_channels
                        .iter()
                        .any(|channel| channel == &request.channel)
                {
                    Ok(())
                } else {
                    debug!(
                        "command {} denied on channel {}",
                        request.command, request.channel
                    );
                    Err(AuthError::ChannelNotAllowed)
                }
            }
        }
    }
}

fn build_map(groups: &HashMap<String, Vec<String>>) -> GroupMap {
    groups
        .iter()
        .map(|(group, members)| (group.clone(), members.iter().cloned().collect()))
        .collect()
}
