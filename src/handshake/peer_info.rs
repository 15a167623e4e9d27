use crate::crypto::Cipher;

/// Client capabilities announced in the AUTH payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Client UI version (`IV_UI_VER`)
    pub ui_version: String,
    /// TLS library version (`IV_SSL`)
    pub ssl_version: Option<String>,
    /// Platform name (`IV_PLAT`)
    pub platform: String,
    /// Data ciphers offered for negotiation (`IV_CIPHERS`)
    pub ciphers: Vec<Cipher>,
    /// Additional `KEY=VALUE` pairs
    pub extra: Vec<(String, String)>,
}

impl PeerInfo {
    /// Peer info for this platform with the given UI version.
    pub fn new(ui_version: impl Into<String>) -> Self {
        Self {
            ui_version: ui_version.into(),
            ssl_version: None,
            platform: current_platform().to_string(),
            ciphers: Vec::new(),
            extra: Vec::new(),
        }
    }

    /// Offer `ciphers` via `IV_CIPHERS`.
    pub fn with_ciphers(mut self, ciphers: Vec<Cipher>) -> Self {
        self.ciphers = ciphers;
        self
    }

    /// Announce the TLS library version.
    pub fn with_ssl_version(mut self, version: impl Into<String>) -> Self {
        self.ssl_version = Some(version.into());
        self
    }

    /// Newline-separated block, terminated by an empty line.
    pub fn render(&self) -> String {
        let mut lines = vec![
            "IV_VER=2.4".to_string(),
            format!("IV_UI_VER={}", self.ui_version),
            "IV_PROTO=2".to_string(),
            "IV_NCP=2".to_string(),
            "IV_LZO_STUB=1".to_string(),
        ];
        if let Some(ssl) = &self.ssl_version {
            lines.push(format!("IV_SSL={}", ssl));
        }
        lines.push(format!("IV_PLAT={}", self.platform));
        if !self.ciphers.is_empty() {
            let names: Vec<&str> = self.ciphers.iter().map(Cipher::name).collect();
            lines.push(format!("IV_CIPHERS={}", names.join(":")));
        }
        for (key, value) in &self.extra {
            lines.push(format!("{}={}", key, value));
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

fn current_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "mac",
        "windows" => "win",
        "ios" => "ios",
        "android" => "android",
        "freebsd" | "openbsd" | "netbsd" => "bsd",
        _ => "linux",
    }
}
