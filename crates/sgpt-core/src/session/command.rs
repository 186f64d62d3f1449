//! ============================================================================
//! Command - Inbound text classified once into a tagged variant
//! ============================================================================
//! The first whitespace-delimited token is matched case-sensitively against
//! the command vocabulary. Everything after it (trimmed) is the argument.
//! Unmatched text is a conversational turn.
//! ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Reset,
    Key(Option<String>),
    Model(Option<String>),
    Context(Option<String>),
    ResetContext,
    ToggleVoice,
    ToggleImgQuality,
    ToggleImgStyle,
    Image(Option<String>),
    Allow(Option<String>),
    Deny(Option<String>),
    Users,
    Usage,
    Info,
    About,
    History,
    /// `<memory id> <text>`
    Memorize(Option<String>),
    Memories,
    Forget(Option<String>),
    ForgetAll,
    Focus(Option<String>),
    ToggleContextFilter,
    /// Text, or a link whose text is fetched first
    Summarize(Option<String>),
    Talk(String),
}

impl Command {
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim_start();
        let (head, rest) = match trimmed.find(char::is_whitespace) {
            Some(pos) => (&trimmed[..pos], trimmed[pos..].trim()),
            None => (trimmed, ""),
        };
        let arg = || (!rest.is_empty()).then(|| rest.to_string());

        match head {
            "/reset" => Command::Reset,
            "/key" => Command::Key(arg()),
            "/model" => Command::Model(arg()),
            "/context" => Command::Context(arg()),
            "/reset_context" => Command::ResetContext,
            "/toggle_voice" => Command::ToggleVoice,
            "/toggle_img_quality" => Command::ToggleImgQuality,
            "/toggle_img_style" => Command::ToggleImgStyle,
            "/image" => Command::Image(arg()),
            "/allow" => Command::Allow(arg()),
            "/deny" => Command::Deny(arg()),
            "/users" => Command::Users,
            "/usage" => Command::Usage,
            "/info" => Command::Info,
            "/about" => Command::About,
            "/history" => Command::History,
            "/memorize" => Command::Memorize(arg()),
            "/memories" => Command::Memories,
            "/forget" => Command::Forget(arg()),
            "/forget_all" => Command::ForgetAll,
            "/focus" => Command::Focus(arg()),
            "/toggle_context_filter" => Command::ToggleContextFilter,
            "/summarize" => Command::Summarize(arg()),
            _ => Command::Talk(text.to_string()),
        }
    }

    /// Commands a blocked user may still run
    pub fn is_informational(&self) -> bool {
        matches!(self, Command::Usage | Command::About)
    }

    pub fn is_admin_only(&self) -> bool {
        matches!(self, Command::Allow(_) | Command::Deny(_) | Command::Users)
    }

    /// Name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::Reset => "reset",
            Command::Key(_) => "key",
            Command::Model(_) => "model",
            Command::Context(_) => "context",
            Command::ResetContext => "reset_context",
            Command::ToggleVoice => "toggle_voice",
            Command::ToggleImgQuality => "toggle_img_quality",
            Command::ToggleImgStyle => "toggle_img_style",
            Command::Image(_) => "image",
            Command::Allow(_) => "allow",
            Command::Deny(_) => "deny",
            Command::Users => "users",
            Command::Usage => "usage",
            Command::Info => "info",
            Command::About => "about",
            Command::History => "history",
            Command::Memorize(_) => "memorize",
            Command::Memories => "memories",
            Command::Forget(_) => "forget",
            Command::ForgetAll => "forget_all",
            Command::Focus(_) => "focus",
            Command::ToggleContextFilter => "toggle_context_filter",
            Command::Summarize(_) => "summarize",
            Command::Talk(_) => "talk",
        }
    }
}
