//! Input cleaning for prompts, free text, HTML fragments, API keys
//! and file names.
//!
//! Every function here is total: bad input degrades to an empty (or
//! placeholder) string instead of an error, and running a function on
//! its own output returns that output unchanged.

use std::sync::OnceLock;
use regex::Regex;
use log::trace;

pub const MAX_TEXT_LENGTH: usize = 10_000;
pub const MAX_PROMPT_LENGTH: usize = 5_000;
pub const MAX_FILE_NAME_LENGTH: usize = 255;

const SCRIPT_BLOCK: &str = r"(?is)<script\b.*?</script\s*>";
const URI_SCHEMES: &str = r"(?i)javascript:|data:text/html|vbscript:";
const EVENT_HANDLER: &str = r"(?i)on[A-Za-z0-9_]+\s*=";
const EXCESS_NEWLINES: &str = r"\n{3,}";
const ANY_TAG: &str = r"<[^>]*>";
const TAG: &str = r"<(/?)([A-Za-z][A-Za-z0-9]*)\b([^>]*)>";
const COMMENT: &str = r"(?s)<!--.*?-->";
const ATTRIBUTE: &str
  = r#"([A-Za-z_:][-A-Za-z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#;

/// Elements dropped together with their content
const DROP_WITH_CONTENT: [&str; 6]
  = ["script", "style", "iframe", "object", "embed", "noscript"];

static SCRIPT_BLOCK_RE: OnceLock<Option<Regex>> = OnceLock::new();
static URI_SCHEMES_RE: OnceLock<Option<Regex>> = OnceLock::new();
static EVENT_HANDLER_RE: OnceLock<Option<Regex>> = OnceLock::new();
static EXCESS_NEWLINES_RE: OnceLock<Option<Regex>> = OnceLock::new();
static ANY_TAG_RE: OnceLock<Option<Regex>> = OnceLock::new();
static TAG_RE: OnceLock<Option<Regex>> = OnceLock::new();
static COMMENT_RE: OnceLock<Option<Regex>> = OnceLock::new();
static ATTRIBUTE_RE: OnceLock<Option<Regex>> = OnceLock::new();
static DROP_WITH_CONTENT_RE: OnceLock<Vec<Regex>> = OnceLock::new();

fn cached(
  cell: &'static OnceLock<Option<Regex>>
, pattern: &str
) -> Option<&'static Regex>
{   cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn replace_all(
  input: &str
, cell: &'static OnceLock<Option<Regex>>
, pattern: &str
, replacement: &str
) -> String
{   match cached(cell, pattern)
    {   Some(re) => re.replace_all(input, replacement).into_owned()
      , None => input.to_string()
    }
}

/// Codepoints 0x00-0x08, 0x0B-0x0C, 0x0E-0x1F and 0x7F
pub fn is_banned_control(c: char) -> bool
{   matches!(
      c
    , '\u{00}'..='\u{08}'
      | '\u{0B}'..='\u{0C}'
      | '\u{0E}'..='\u{1F}'
      | '\u{7F}'
    )
}

fn strip_control(input: &str) -> String
{   input.chars().filter(|c| !is_banned_control(*c)).collect()
}

fn truncate_chars(input: &str, max: usize) -> &str
{   match input.char_indices().nth(max)
    {   Some((idx, _)) => &input[..idx]
      , None => input
    }
}

/// Whitespace as JavaScript's `\s` sees it: Unicode `White_Space`
/// without U+0085, plus U+FEFF
pub fn is_js_whitespace(c: char) -> bool
{   (c.is_whitespace() && c != '\u{85}') || c == '\u{FEFF}'
}

/// Clean free text: control characters removed, whitespace runs
/// collapsed to one space, trimmed, capped at 10000 characters.
pub fn sanitize_text(input: &str) -> String
{   if input.is_empty()
    {   return String::new();
    }

    let mut collapsed = String::with_capacity(input.len());
    let mut in_space = false;
    for c in input.chars().filter(|c| !is_banned_control(*c))
    {   if is_js_whitespace(c)
        {   if !in_space
            {   collapsed.push(' ');
            }
            in_space = true;
        } else
        {   collapsed.push(c);
            in_space = false;
        }
    }

    truncate_chars(collapsed.trim_matches(' '), MAX_TEXT_LENGTH)
      .trim_end_matches(' ')
      .to_string()
}

/// Clean a prompt: script blocks, dangerous URI schemes and inline
/// event handlers removed, line endings normalised to `\n`, blank
/// line runs capped at one empty line, capped at 5000 characters.
pub fn sanitize_prompt(input: &str) -> String
{   if input.is_empty()
    {   return String::new();
    }

    let normalized = strip_control(input)
      .replace("\r\n", "\n")
      .replace('\r', "\n");
    // Removals only shrink the text, so cutting first keeps the cap
    // and bounds the passes below.
    let mut sanitized = truncate_chars(&normalized, MAX_PROMPT_LENGTH)
      .to_string();

    // A removal can splice a new match together, so repeat until
    // nothing changes.
    loop
    {   let next = strip_markup_threats(&sanitized);
        if next == sanitized
        {   break;
        }
        trace!("sanitize_prompt removed {} bytes"
        , sanitized.len() - next.len()
        );
        sanitized = next;
    }

    let sanitized = replace_all(
      &sanitized
    , &EXCESS_NEWLINES_RE
    , EXCESS_NEWLINES
    , "\n\n"
    );

    truncate_chars(&sanitized, MAX_PROMPT_LENGTH).to_string()
}

fn strip_markup_threats(input: &str) -> String
{   let out = replace_all(input, &SCRIPT_BLOCK_RE, SCRIPT_BLOCK, "");
    let out = replace_all(&out, &URI_SCHEMES_RE, URI_SCHEMES, "");
    replace_all(&out, &EVENT_HANDLER_RE, EVENT_HANDLER, "")
}

/// Allow-list for [`sanitize_html`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizationOptions
{   pub allowed_tags: Vec<String>
  , pub allowed_attributes: Vec<String>
  , /// Remove tags outside the allow-list; when false they are
    /// escaped and shown as text instead
    pub strip_ignore_tag: bool
}

impl Default for SanitizationOptions
{   fn default() -> Self
    {   let tags = [
          "p", "br", "strong", "em", "u"
        , "h1", "h2", "h3", "h4", "h5", "h6"
        , "ul", "ol", "li", "blockquote", "code", "pre"
        ];
        SanitizationOptions
        {   allowed_tags: tags.iter().map(|t| t.to_string()).collect()
          , allowed_attributes: vec![
              "class".to_string()
            , "id".to_string()
            ]
          , strip_ignore_tag: true
        }
    }
}

/// Remove every tag, keeping only text
pub fn strip_html_tags(input: &str) -> String
{   replace_all(input, &ANY_TAG_RE, ANY_TAG, "")
}

/// Reduce an HTML fragment to the allow-listed tags and attributes.
///
/// Without options the default allow-list is used. If the tag
/// patterns cannot be compiled the fragment degrades to plain text.
pub fn sanitize_html(
  input: &str
, options: Option<&SanitizationOptions>
) -> String
{   let defaults;
    let options = match options
    {   Some(o) => o
      , None => {
          defaults = SanitizationOptions::default();
          &defaults
        }
    };

    let (Some(tag_re), Some(attr_re)) = (
      cached(&TAG_RE, TAG)
    , cached(&ATTRIBUTE_RE, ATTRIBUTE)
    ) else
    {   return strip_html_tags(input);
    };

    let mut html = replace_all(input, &COMMENT_RE, COMMENT, "");
    for re in drop_with_content_patterns()
    {   html = re.replace_all(&html, "").into_owned();
    }

    let mut out = String::with_capacity(html.len());
    let mut last = 0;
    for caps in tag_re.captures_iter(&html)
    {   let Some(whole) = caps.get(0) else { continue };
        out.push_str(&escape_angle_brackets(&html[last..whole.start()]));
        last = whole.end();

        let closing = !caps[1].is_empty();
        let name = caps[2].to_ascii_lowercase();
        let allowed = options.allowed_tags
          .iter()
          .any(|t| t.eq_ignore_ascii_case(&name));

        if !allowed
        {   if !options.strip_ignore_tag
            {   out.push_str(&escape_html(whole.as_str()));
            }
            continue;
        }

        if closing
        {   out.push_str(&format!("</{}>", name));
            continue;
        }

        out.push('<');
        out.push_str(&name);
        for attr in attr_re.captures_iter(&caps[3])
        {   let attr_name = attr[1].to_ascii_lowercase();
            if !options.allowed_attributes
              .iter()
              .any(|a| a.eq_ignore_ascii_case(&attr_name))
            {   continue;
            }
            let value = attr.get(2)
              .or_else(|| attr.get(3))
              .or_else(|| attr.get(4))
              .map(|m| m.as_str())
              .unwrap_or("");
            out.push_str(&format!(
              " {}=\"{}\"", attr_name, escape_html(value)
            ));
        }
        out.push('>');
    }
    out.push_str(&escape_angle_brackets(&html[last..]));
    out
}

/// Text between tags. A stray `<` must not open a tag later on.
/// Entities are left alone so a second pass changes nothing.
fn escape_angle_brackets(text: &str) -> String
{   text.replace('<', "&lt;").replace('>', "&gt;")
}

fn drop_with_content_patterns() -> &'static [Regex]
{   DROP_WITH_CONTENT_RE.get_or_init(|| {
      DROP_WITH_CONTENT
        .iter()
        .filter_map(|name| {
          Regex::new(&format!(
            r"(?is)<{name}\b.*?</{name}\s*>|<{name}\b[^>]*/?>"
          )).ok()
        })
        .collect()
    })
}

/// True iff the trimmed key is at least 20 characters from
/// `[A-Za-z0-9_-]`
pub fn validate_api_key(key: &str) -> bool
{   let key = key.trim();
    key.len() >= 20
      && key.chars()
          .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub fn escape_html(text: &str) -> String
{   let mut out = String::with_capacity(text.len());
    for c in text.chars()
    {   match c
        {   '&' => out.push_str("&amp;")
          , '<' => out.push_str("&lt;")
          , '>' => out.push_str("&gt;")
          , '"' => out.push_str("&quot;")
          , '\'' => out.push_str("&#039;")
          , _ => out.push(c)
        }
    }
    out
}

/// File-system-safe name; `"untitled"` when nothing usable remains
pub fn sanitize_file_name(name: &str) -> String
{   let trimmed = name.trim();
    if trimmed.is_empty()
    {   return "untitled".to_string();
    }

    let mut out = String::with_capacity(trimmed.len());
    for c in trimmed.chars()
    {   let c = if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
        {   c
        } else
        {   '_'
        };
        if c == '_' && out.ends_with('_')
        {   continue;
        }
        out.push(c);
    }

    truncate_chars(&out, MAX_FILE_NAME_LENGTH).to_string()
}

#[cfg(test)]
mod tests
{   use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sanitize_text_basics()
    {   assert_eq!(sanitize_text(""), "");
        assert_eq!(sanitize_text("  hello \t\n  world  "), "hello world");
        assert_eq!(sanitize_text("a\u{0}b\u{7F}c"), "abc");
        assert_eq!(sanitize_text(" \u{1} a"), "a");
    }

    #[test]
    fn test_sanitize_text_js_whitespace_set()
    {   assert_eq!(sanitize_text("a\u{FEFF}\u{FEFF}b"), "a b");
        assert_eq!(sanitize_text("\u{FEFF}a\u{A0}b\u{3000}"), "a b");
        assert_eq!(sanitize_text("a\u{85}b"), "a\u{85}b");
        assert_eq!(sanitize_text("\u{85}a"), "\u{85}a");
    }

    #[test]
    fn test_sanitize_text_caps_length()
    {   let long = "x".repeat(MAX_TEXT_LENGTH + 50);
        assert_eq!(sanitize_text(&long).chars().count(), MAX_TEXT_LENGTH);
    }

    #[test]
    fn test_sanitize_prompt_strips_scripts_and_schemes()
    {   let dirty = "Hi <SCRIPT type=\"x\">alert(1)\n</script> there \
                     javascript:go() vbscript:x DATA:TEXT/HTML,y \
                     <img onerror = boom>";
        let clean = sanitize_prompt(dirty);
        assert!(!clean.to_lowercase().contains("<script"));
        assert!(!clean.to_lowercase().contains("javascript:"));
        assert!(!clean.to_lowercase().contains("vbscript:"));
        assert!(!clean.to_lowercase().contains("data:text/html"));
        assert!(!clean.contains("onerror"));
        assert!(clean.starts_with("Hi "));
    }

    #[test]
    fn test_sanitize_prompt_rejoined_scheme_is_removed()
    {   let clean = sanitize_prompt("javajavascript:script:run");
        assert_eq!(clean, "run");
    }

    #[test]
    fn test_sanitize_prompt_nested_schemes_are_capped_first()
    {   // 2400 + 2597 + "scr" = 5000 chars survive the cut; each pass
        // removes one spliced "javascript:"
        let nested = format!("{}{}", "java".repeat(600), "script:".repeat(600));
        assert_eq!(
          sanitize_prompt(&nested)
        , format!("{}scr", "java".repeat(229))
        );
    }

    #[test]
    fn test_sanitize_prompt_large_paste()
    {   let n = 200_000;
        let nested = format!("{}{}", "java".repeat(n), "script:".repeat(n));
        let clean = sanitize_prompt(&nested);
        assert_eq!(clean.chars().count(), MAX_PROMPT_LENGTH);
        assert!(!clean.contains("javascript:"));
    }

    #[test]
    fn test_sanitize_prompt_line_endings()
    {   let clean = sanitize_prompt("a\r\nb\rc\n\n\n\n\nd");
        assert_eq!(clean, "a\nb\nc\n\nd");
    }

    #[test]
    fn test_sanitize_prompt_keeps_leading_whitespace()
    {   assert_eq!(sanitize_prompt("  indented"), "  indented");
    }

    #[test]
    fn test_strip_html_tags()
    {   assert_eq!(strip_html_tags("<p>Hi <b>there</b></p>"), "Hi there");
    }

    #[test]
    fn test_sanitize_html_allow_list()
    {   let html = r#"<p class="lead" onclick="x()">Hi <b>bold</b></p><script>bad()</script><em id='e'>ok</em>"#;
        assert_eq!(
          sanitize_html(html, None)
        , r#"<p class="lead">Hi bold</p><em id="e">ok</em>"#
        );
    }

    #[test]
    fn test_sanitize_html_escapes_when_not_stripping()
    {   let options = SanitizationOptions
        {   strip_ignore_tag: false
          , ..SanitizationOptions::default()
        };
        assert_eq!(
          sanitize_html("<p>a<span>b</span></p>", Some(&options))
        , "<p>a&lt;span&gt;b&lt;/span&gt;</p>"
        );
    }

    #[test]
    fn test_sanitize_html_unclosed_tag_is_inert()
    {   let clean = sanitize_html("<p>a</p><img src=x onerror=alert(1)", None);
        assert_eq!(clean, "<p>a</p>&lt;img src=x onerror=alert(1)");
        assert_eq!(sanitize_html(&clean, None), clean);

        let joined = format!("{}<p>b</p>", clean);
        assert_eq!(
          sanitize_html(&joined, None)
        , "<p>a</p>&lt;img src=x onerror=alert(1)<p>b</p>"
        );
        assert_eq!(sanitize_html("1 < 2 > 0", None), "1 &lt; 2 &gt; 0");
    }

    #[test]
    fn test_validate_api_key()
    {   assert!(!validate_api_key("short"));
        assert!(validate_api_key(&"A".repeat(20)));
        assert!(validate_api_key(&format!("  {}  ", "A_-9".repeat(5))));
        assert!(!validate_api_key(&format!("has space{}", "A".repeat(20))));
        assert!(!validate_api_key(""));
    }

    #[test]
    fn test_escape_html()
    {   assert_eq!(
          escape_html(r#"<a href="x">Tom & 'Jerry'</a>"#)
        , "&lt;a href=&quot;x&quot;&gt;Tom &amp; &#039;Jerry&#039;&lt;/a&gt;"
        );
    }

    #[test]
    fn test_sanitize_file_name()
    {   assert_eq!(sanitize_file_name(""), "untitled");
        assert_eq!(sanitize_file_name("   "), "untitled");
        assert_eq!(sanitize_file_name(" my file?.txt "), "my_file_.txt");
        assert_eq!(sanitize_file_name("a  //  b"), "a_b");
        assert_eq!(
          sanitize_file_name(&"n".repeat(300)).len()
        , MAX_FILE_NAME_LENGTH
        );
    }

    proptest!
    {   #[test]
        fn prop_sanitize_text_idempotent(s in "\\PC*|[\\x00-\\x7F]{0,64}")
        {   let once = sanitize_text(&s);
            prop_assert_eq!(sanitize_text(&once), once.clone());
            prop_assert!(once.chars().count() <= MAX_TEXT_LENGTH);
            prop_assert!(!once.chars().any(is_banned_control));
        }

        #[test]
        fn prop_sanitize_prompt_invariants(
          s in "([\\x00-\\x7F]|<script>|</script>|javascript:|\r)*"
        )
        {   let once = sanitize_prompt(&s);
            let lower = once.to_lowercase();
            prop_assert!(once.chars().count() <= MAX_PROMPT_LENGTH);
            prop_assert!(!once.contains('\r'));
            prop_assert!(!lower.contains("javascript:"));
            prop_assert!(!lower.contains("vbscript:"));
            prop_assert!(!lower.contains("data:text/html"));
            prop_assert!(!once.chars().any(is_banned_control));
            prop_assert_eq!(sanitize_prompt(&once), once.clone());
        }

        #[test]
        fn prop_sanitize_file_name_idempotent(s in "\\PC{0,40}")
        {   let once = sanitize_file_name(&s);
            prop_assert_eq!(sanitize_file_name(&once), once);
        }
    }
}
