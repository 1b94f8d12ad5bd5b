use std::fmt;

/// Verbs the streaming core understands. Everything else is routed through
/// the registered synchronous handlers or echoed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandVerb {
    ListDir,
    DownloadFile,
    StartCam,
    StopCam,
    Ping,
}

impl CommandVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandVerb::ListDir => "list_dir",
            CommandVerb::DownloadFile => "download_file",
            CommandVerb::StartCam => "start_cam",
            CommandVerb::StopCam => "stop_cam",
            CommandVerb::Ping => "PING",
        }
    }

    pub fn from_verb(verb: &str) -> Option<Self> {
        match verb {
            "list_dir" => Some(CommandVerb::ListDir),
            "download_file" => Some(CommandVerb::DownloadFile),
            "start_cam" => Some(CommandVerb::StartCam),
            "stop_cam" => Some(CommandVerb::StopCam),
            "PING" => Some(CommandVerb::Ping),
            _ => None,
        }
    }
}

impl fmt::Display for CommandVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound command: `<verb> <arg>`.
///
/// The verb ends at the first whitespace run; the argument is everything after
/// that run, so paths containing spaces survive intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command<'a> {
    pub verb: &'a str,
    pub arg: &'a str,
}

impl<'a> Command<'a> {
    /// Returns `None` for blank input.
    pub fn parse(text: &'a str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        match text.find(char::is_whitespace) {
            Some(split) => {
                let (verb, rest) = text.split_at(split);
                Some(Self {
                    verb,
                    arg: rest.trim_start(),
                })
            }
            None => Some(Self { verb: text, arg: "" }),
        }
    }

    pub fn known_verb(&self) -> Option<CommandVerb> {
        CommandVerb::from_verb(self.verb)
    }

    /// Renders the command back into its wire form.
    pub fn render(verb: CommandVerb, arg: &str) -> String {
        if arg.is_empty() {
            verb.as_str().to_string()
        } else {
            format!("{} {}", verb.as_str(), arg)
        }
    }
}
