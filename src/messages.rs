use crate::classify::FeatureFlags;
use url::form_urlencoded;

/// Which corrective message a document's flags call for, at most one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    CodeFences,
    SomeCodeOutsideBlock,
    CodeOutsideBlock,
    MultilineInlineCode,
    VeryLongInlineCode,
}

/// Map a flag bitset to a message kind. Strict dominance order, first match
/// wins: fenced-plus-unfenced beats everything, then the some/all code
/// outside block pair, then the inline-code complaints.
pub fn determine(flags: FeatureFlags) -> Option<MessageKind> {
    let fences = FeatureFlags::CODE_OUTSIDE_OF_CODE_BLOCK | FeatureFlags::CODE_FENCE;
    let some_outside = FeatureFlags::CODE_OUTSIDE_OF_CODE_BLOCK | FeatureFlags::CONTAINS_CODE_BLOCK;

    if flags.contains(fences) {
        Some(MessageKind::CodeFences)
    } else if flags.contains(some_outside) {
        Some(MessageKind::SomeCodeOutsideBlock)
    } else if flags.intersects(FeatureFlags::CODE_OUTSIDE_OF_CODE_BLOCK) {
        Some(MessageKind::CodeOutsideBlock)
    } else if flags.intersects(FeatureFlags::MULTILINE_INLINE_CODE) {
        Some(MessageKind::MultilineInlineCode)
    } else if flags.intersects(FeatureFlags::VERY_LONG_INLINE_CODE) {
        Some(MessageKind::VeryLongInlineCode)
    } else {
        None
    }
}

const THEMATIC_BREAK: &str = "\n-----\n\n";

/// Context for rendering one reply.
pub struct MessageContext<'a> {
    pub document_id: &'a str,
    pub permalink_path: &'a str,
    pub body_len: usize,
    /// True when the latest classification came back clean and the reply is
    /// being edited to congratulate rather than correct.
    pub passing: bool,
}

/// Renders reply bodies. Pure string assembly; the site base URL and the
/// bot's account name are the only ambient inputs.
pub struct MessageBuilder {
    site_base_url: String,
    bot_username: String,
}

impl MessageBuilder {
    pub fn new(site_base_url: &str, bot_username: &str) -> MessageBuilder {
        MessageBuilder {
            site_base_url: site_base_url.trim_end_matches('/').to_string(),
            bot_username: bot_username.to_string(),
        }
    }

    pub fn build(&self, kind: MessageKind, ctx: &MessageContext<'_>) -> String {
        let mut out = String::new();
        out.push_str(&self.body_section(kind, ctx.permalink_path));
        out.push_str(THEMATIC_BREAK);
        out.push_str(&pester_section(kind, ctx));
        out.push_str(THEMATIC_BREAK);
        out.push_str(&self.footer_section(ctx.document_id));
        out
    }

    /// Short nudge posted by the throttled follow-up worker when a record is
    /// still failing after a recheck.
    pub fn followup(&self, kind: MessageKind, permalink_path: &str) -> String {
        let hint = match kind {
            MessageKind::CodeFences => "the fenced code still needs to be an indented code block",
            MessageKind::SomeCodeOutsideBlock => "some of the code is still outside a code block",
            MessageKind::CodeOutsideBlock => "the code is still not in a code block",
            MessageKind::MultilineInlineCode => "the inline code spans still want to be a code block",
            MessageKind::VeryLongInlineCode => "that long inline span still wants to be a code block",
        };
        format!(
            "Checked [the post]({}{}) again: {}.\n\n{}",
            self.site_base_url, permalink_path, hint, SIGNATURE,
        )
    }

    pub fn acknowledgment(&self) -> String {
        format!("Good human.\n\n{SIGNATURE}")
    }

    fn body_section(&self, kind: MessageKind, permalink_path: &str) -> String {
        let post_url = format!("{}{}", self.site_base_url, permalink_path);
        match kind {
            MessageKind::CodeOutsideBlock => format!(
                "Looks like your PowerShell code isn\u{2019}t wrapped in a code block.\n\n\
                 To properly style code, highlight it and choose \u{2018}Code Block\u{2019} \
                 from the editing toolbar, or separate the code from your text with a blank \
                 line gap and precede each line of code with **4 spaces** or a **tab**.\n\n\
                 [your post]: {post_url}\n"
            ),
            MessageKind::SomeCodeOutsideBlock => format!(
                "Some of your PowerShell code isn\u{2019}t enclosed in a code block.\n\n\
                 To properly style code, highlight it and choose \u{2018}Code Block\u{2019} \
                 from the editing toolbar, or separate the code from your text with a blank \
                 line gap and precede each line of code with **4 spaces** or a **tab**.\n\n\
                 [your post]: {post_url}\n"
            ),
            MessageKind::MultilineInlineCode => format!(
                "It appears that you have used *inline code* formatting when a **code \
                 block** should have been used.\n\n\
                 Consider using a code block for longer sequences of code. To correct the \
                 formatting, highlight your code then click the \u{2018}Code Block\u{2019} \
                 button in the editing toolbar.\n\n\
                 [your post]: {post_url}\n"
            ),
            MessageKind::VeryLongInlineCode => format!(
                "That\u{2019}s a really long line of inline code.\n\n\
                 Inline code spans do not word wrap, making it difficult for many readers \
                 to see all your code. To ensure your code is readable by everyone, \
                 highlight it and select \u{2018}Code Block\u{2019} in the editing \
                 toolbar.\n\n\
                 [your post]: {post_url}\n"
            ),
            MessageKind::CodeFences => format!(
                "Code fences don\u{2019}t render on every client that will show your \
                 post.\n\n\
                 If you want everyone to see your PowerShell code formatted correctly then \
                 consider using a regular space-indented **code block** instead: highlight \
                 your code and select \u{2018}Code Block\u{2019} in the editing toolbar.\n\n\
                 [your post]: {post_url}\n"
            ),
        }
    }

    fn footer_section(&self, document_id: &str) -> String {
        let message = "Click \u{2018}send\u{2019} to immediately delete the bot\u{2019}s \
                       comment.\n\n\
                       The comment will not be deleted if:\n\n\
                       * You are not the submitter of the post.\n\
                       * There are any replies on the comment.\n";
        let query: String = form_urlencoded::Serializer::new(String::new())
            .append_pair("to", &self.bot_username)
            .append_pair("subject", &format!("!delete {document_id}"))
            .append_pair("message", message)
            .finish();
        let deletion_form_url = format!("{}/message/compose?{}", self.site_base_url, query);

        format!("{SIGNATURE} | [Remove-Item]\n\n[Remove-Item]: {deletion_form_url}\n")
    }
}

const SIGNATURE: &str = "&thinsp;^(*Beep-boop, I am a bot.*)";

// Pester-flavoured status block, in homage to the original.
fn pester_section(kind: MessageKind, ctx: &MessageContext<'_>) -> String {
    let (sign, symbol) = if ctx.passing {
        ('+', "\u{2705}")
    } else if matches!(kind, MessageKind::CodeFences | MessageKind::SomeCodeOutsideBlock) {
        ('~', "\u{26a0}\u{fe0f}")
    } else {
        ('-', "\u{274c}")
    };

    let thing = ctx
        .permalink_path
        .trim_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(ctx.document_id);

    format!(
        "    Describing {thing}\n      [{sign}] Well formatted\n    \
         Tests completed in {}ms\n    Tests Passed: {symbol}\n",
        ctx.body_len,
    )
}
