use std::str::FromStr;

/// Where the server advertises its targets.
///
/// Parsed from the `--inspect-publish-uid` syntax, e.g. `"stderr,http"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InspectPublishUid {
    /// Print "Debugger listening on ..." notices.
    pub console: bool,
    /// Serve the `/json` discovery endpoints.
    pub http: bool,
}

impl Default for InspectPublishUid {
    fn default() -> Self {
        Self {
            console: true,
            http: true,
        }
    }
}

impl FromStr for InspectPublishUid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut uid = Self {
            console: false,
            http: false,
        };

        for destination in s.split(',').map(str::trim) {
            match destination {
                "stderr" => uid.console = true,
                "http" => uid.http = true,
                other => {
                    return Err(format!(
                        "--inspect-publish-uid destination can be stderr or http, got {:?}",
                        other
                    ));
                }
            }
        }
        Ok(uid)
    }
}

/// Inspector server configuration.
#[derive(Clone, Debug, Default)]
pub struct ServerOptions {
    pub publish_uid: InspectPublishUid,

    /// Process id used to name the local discovery socket. `None` disables it.
    pub pid: Option<u32>,

    /// Accept any `Host` header instead of only IP literals and `localhost`.
    pub allow_any_host: bool,
}
