use std::sync::Arc;
use tracing::instrument;

use super::{CredentialGenerator, Voucher};
use crate::device::{DeviceError, DeviceManager};
use crate::offer::ProfileName;

/// RouterOS menu holding hotspot users.
pub const CREATE_USER_COMMAND: &str = "/ip/hotspot/user/add";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IssueError {
    /// Both the first attempt and the single retry failed.
    #[error("Voucher issuance failed after retry: {0}")]
    Exhausted(DeviceError),
}

/// Provisions hotspot users on the device.
///
/// One issuance is at most two attempts. An attempt is "make the connection ready, then
/// run the create-user command". If the first attempt fails at either step, the
/// connection is forced down, re-established, and the command is sent once more with the
/// same credentials. A second failure is final and leaves nothing to clean up in the
/// engine; the device may still hold the user if it executed a command whose reply was
/// lost.
#[derive(Clone)]
pub struct VoucherIssuer {
    device: DeviceManager,
    credentials: Arc<CredentialGenerator>,
}

impl VoucherIssuer {
    pub fn new(device: DeviceManager, credentials: CredentialGenerator) -> Self {
        Self {
            device,
            credentials: Arc::new(credentials),
        }
    }

    pub fn device(&self) -> &DeviceManager {
        &self.device
    }

    #[instrument(skip_all, err, fields(profile = %profile))]
    pub async fn issue(&self, profile: &ProfileName) -> Result<Voucher, IssueError> {
        let voucher = self.credentials.generate().await;
        match self.attempt(&voucher, profile).await {
            Ok(()) => return Ok(voucher),
            Err(error) => {
                tracing::warn!(%error, username = %voucher.username, "Create-user failed, reconnecting for one retry");
            }
        }
        self.device.force_disconnect().await;
        self.attempt(&voucher, profile)
            .await
            .map_err(IssueError::Exhausted)?;
        tracing::info!(username = %voucher.username, "Create-user succeeded on retry");
        Ok(voucher)
    }

    async fn attempt(&self, voucher: &Voucher, profile: &ProfileName) -> Result<(), DeviceError> {
        self.device.ensure_ready().await?;
        self.device
            .write_command(
                CREATE_USER_COMMAND,
                &[
                    ("name", voucher.username.as_str()),
                    ("password", voucher.password.as_str()),
                    ("profile", profile.as_str()),
                ],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ConnectionState;
    use crate::device::testing::{ScriptedConnector, Step};

    fn issuer(connector: &ScriptedConnector) -> VoucherIssuer {
        VoucherIssuer::new(
            DeviceManager::new(connector.clone()),
            CredentialGenerator::seeded(7),
        )
    }

    fn trap() -> DeviceError {
        DeviceError::Command("failure: already have user with this name".to_string())
    }

    fn refused() -> DeviceError {
        DeviceError::Transport("connection refused".to_string())
    }

    #[tokio::test]
    async fn test_issue_creates_user_with_profile() {
        let connector = ScriptedConnector::default();
        let issuer = issuer(&connector);
        let voucher = issuer.issue(&ProfileName::new("1H")).await.unwrap();

        let calls = connector.0.write_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, CREATE_USER_COMMAND);
        assert_eq!(
            calls[0].1,
            vec![
                ("name".to_string(), voucher.username.clone()),
                ("password".to_string(), voucher.password.clone()),
                ("profile".to_string(), "1H".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_command_failure_retries_once_with_same_credentials() {
        let connector = ScriptedConnector::default();
        connector.0.writes([Step::Fail(trap())]);
        let issuer = issuer(&connector);
        let voucher = issuer.issue(&ProfileName::new("1H")).await.unwrap();

        let calls = connector.0.write_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1]);
        assert_eq!(calls[1].1[0].1, voucher.username);
        assert_eq!(connector.0.connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_second_command_failure_is_final() {
        let connector = ScriptedConnector::default();
        connector.0.writes([Step::Fail(trap()), Step::Fail(trap())]);
        let issuer = issuer(&connector);
        let error = issuer.issue(&ProfileName::new("1H")).await.unwrap_err();
        assert_eq!(error, IssueError::Exhausted(trap()));
        assert_eq!(connector.0.write_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_device_down_then_reconnect_succeeds() {
        let connector = ScriptedConnector::default();
        connector.0.connects([Step::Fail(refused())]);
        let issuer = issuer(&connector);
        issuer.issue(&ProfileName::new("1D")).await.unwrap();
        assert_eq!(connector.0.connect_calls(), 2);
        assert_eq!(connector.0.write_calls().len(), 1);
        assert_eq!(issuer.device().state().await, ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_device_down_and_reconnect_fails_twice() {
        let connector = ScriptedConnector::default();
        connector.0.connects([Step::Fail(refused()), Step::Fail(refused())]);
        let issuer = issuer(&connector);
        let error = issuer.issue(&ProfileName::new("1D")).await.unwrap_err();
        assert!(matches!(error, IssueError::Exhausted(DeviceError::Unavailable(_))));
        assert_eq!(connector.0.connect_calls(), 2);
        assert!(connector.0.write_calls().is_empty());
        assert_eq!(issuer.device().state().await, ConnectionState::Disconnected);
    }
}
