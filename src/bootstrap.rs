//! User-data script that installs the tunnel server on a fresh host.
//!
//! The script downloads the requested release, installs its systemd unit and
//! writes the auth token (and control port for the OSS server) into the
//! unit's environment file.

use std::borrow::Cow;

use rand::Rng;
use rand::distributions::Alphanumeric;
use shell_escape::unix::escape;
use thiserror::Error;

/// OSS release installed when none is configured.
pub const DEFAULT_OSS_VERSION: &str = "2.7.4";
/// Pro release installed when none is configured.
pub const DEFAULT_PRO_VERSION: &str = "0.7.0";
/// Length of generated auth tokens.
pub const TOKEN_LENGTH: usize = 64;

/// Errors raised while rendering user data.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BootstrapError {
    /// Raised when the auth token is empty.
    #[error("auth token must not be empty")]
    EmptyToken,
    /// Raised when a release version contains characters unsafe in a URL path.
    #[error("release version '{0}' may only contain letters, digits, '.', '-' and '_'")]
    InvalidVersion(String),
}

/// Inputs for [`BootstrapRequest::render`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootstrapRequest {
    /// Token clients present to the tunnel server.
    pub auth_token: String,
    /// Control port for the OSS server.
    pub control_port: u16,
    /// Release to download.
    pub version: String,
    /// Installs the pro server instead of the OSS one.
    pub pro: bool,
}

impl BootstrapRequest {
    /// Renders the user-data script.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] when the token is empty or the version is
    /// not a plain release tag.
    pub fn render(&self) -> Result<String, BootstrapError> {
        if self.auth_token.trim().is_empty() {
            return Err(BootstrapError::EmptyToken);
        }
        let version = self.version.trim();
        if version.is_empty()
            || !version
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            return Err(BootstrapError::InvalidVersion(self.version.clone()));
        }
        let token = escape(Cow::Borrowed(self.auth_token.as_str()));
        Ok(if self.pro {
            pro_script(&token, version)
        } else {
            oss_script(&token, self.control_port, version)
        })
    }
}

fn pro_script(token: &str, version: &str) -> String {
    format!(
        r#"#!/bin/bash
export AUTHTOKEN={token}
export IP=$(curl -sfSL https://checkip.amazonaws.com)

curl -SLsf https://github.com/inlets/inlets-pro/releases/download/{version}/inlets-pro > /tmp/inlets-pro && \
  chmod +x /tmp/inlets-pro && \
  mv /tmp/inlets-pro /usr/local/bin/inlets-pro

curl -sLO https://raw.githubusercontent.com/inlets/inlets-pro/master/artifacts/inlets-pro.service && \
  mv inlets-pro.service /etc/systemd/system/inlets-pro.service && \
  echo "AUTHTOKEN=$AUTHTOKEN" >> /etc/default/inlets-pro && \
  echo "IP=$IP" >> /etc/default/inlets-pro && \
  systemctl start inlets-pro && \
  systemctl enable inlets-pro
"#
    )
}

fn oss_script(token: &str, control_port: u16, version: &str) -> String {
    format!(
        r#"#!/bin/bash
export AUTHTOKEN={token}
export CONTROLPORT="{control_port}"

curl -SLsf https://github.com/inlets/inlets/releases/download/{version}/inlets > /tmp/inlets && \
  chmod +x /tmp/inlets && \
  mv /tmp/inlets /usr/local/bin/inlets

curl -sLO https://raw.githubusercontent.com/inlets/inlets/master/hack/inlets-operator.service && \
  mv inlets-operator.service /etc/systemd/system/inlets.service && \
  echo "AUTHTOKEN=$AUTHTOKEN" > /etc/default/inlets && \
  echo "CONTROLPORT=$CONTROLPORT" >> /etc/default/inlets && \
  systemctl start inlets && \
  systemctl enable inlets
"#
    )
}

/// Generates an alphanumeric auth token of [`TOKEN_LENGTH`] characters.
#[must_use]
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}
