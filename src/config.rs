//! ICE server configuration handed to the media engine when a peer link is
//! created.

/// A single STUN or TURN server entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    /// TURN username; `None` for plain STUN servers.
    pub username: Option<String>,
    /// TURN credential. Overridden by the session credential when one is
    /// active, see [`RtcConfig::with_credential`].
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// Connection configuration applied to every new peer link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
        }
    }
}

impl RtcConfig {
    /// Returns a copy with the session credential applied to every server
    /// that authenticates (i.e. declares a username). STUN entries are left
    /// untouched.
    pub fn with_credential(&self, credential: &str) -> Self {
        let mut config = self.clone();
        if credential.is_empty() {
            return config;
        }
        for server in &mut config.ice_servers {
            if server.username.is_some() {
                server.credential = Some(credential.to_string());
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_overlays_turn_entries_only() {
        let config = RtcConfig {
            ice_servers: vec![
                IceServer::stun("stun:stun.example.org:3478"),
                IceServer::turn("turn:turn.example.org:3478", "user", "old"),
            ],
        };
        let updated = config.with_credential("fresh");
        assert_eq!(updated.ice_servers[0].credential, None);
        assert_eq!(updated.ice_servers[1].credential, Some("fresh".into()));
    }

    #[test]
    fn empty_credential_is_ignored() {
        let config = RtcConfig::default();
        assert_eq!(config.with_credential(""), config);
    }
}
