#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "quota",
        action: "show_quota",
    },
    CommandSpec {
        command: "generate",
        action: "generate",
    },
    CommandSpec {
        command: "clear_image",
        action: "clear_reference",
    },
    CommandSpec {
        command: "restart",
        action: "start_over",
    },
    CommandSpec {
        command: "logout",
        action: "logout",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "image",
    action: "set_reference",
}];

pub(crate) const INDEX_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "select",
    action: "select_candidate",
}];

pub const SESSION_HELP_COMMANDS: &[&str] = &[
    "/help",
    "/quota",
    "/image",
    "/clear_image",
    "/generate",
    "/select",
    "/restart",
    "/logout",
];
