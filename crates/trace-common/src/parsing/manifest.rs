//! Line parser for the platform package manifest.
//!
//! The manifest is an XML-ish line-oriented file. The only lines of interest
//! are `<package …>` tags, whose `name`, `userId` and `sharedUserId`
//! attributes bind a package to the uid its processes run under. The parser
//! never mutates its input: attributes are tokenised as read-only slices,
//! in any order, and quoted values may contain backslash-escaped characters.

/// Attributes extracted from one `<package …>` tag. Absent attributes stay
/// `None`; a tag carries `userId` or `sharedUserId` depending on whether the
/// package shares its uid with others.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PackageTag {
    pub name: Option<String>,
    pub user_id: Option<u32>,
    pub shared_user_id: Option<u32>,
}

/// Parse one manifest line. Returns `None` for anything that is not a
/// `<package …>` tag; malformed attributes end tokenisation early instead of
/// failing the line.
pub fn parse_package_tag(line: &str) -> Option<PackageTag> {
    let line = line.trim();
    let attrs = line.strip_prefix("<package ")?;
    let attrs = attrs
        .strip_suffix("/>")
        .or_else(|| attrs.strip_suffix('>'))?;

    let mut tag = PackageTag::default();
    let attributes = Attributes { rest: attrs };
    for (key, value) in attributes {
        match key {
            "name" => tag.name = Some(value),
            "userId" => tag.user_id = value.parse().ok(),
            "sharedUserId" => tag.shared_user_id = value.parse().ok(),
            _ => {}
        }
    }
    Some(tag)
}

/// Iterator over `key="value"` pairs of a tag body.
struct Attributes<'a> {
    rest: &'a str,
}

impl<'a> Iterator for Attributes<'a> {
    type Item = (&'a str, String);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.rest.trim_start();
        let eq = rest.find('=')?;
        let key = rest[..eq].trim_end();
        let quoted = rest[eq + 1..].trim_start().strip_prefix('"')?;

        let mut value = String::new();
        let mut chars = quoted.char_indices();
        let end = loop {
            match chars.next()? {
                (_, '\\') => {
                    let (_, escaped) = chars.next()?;
                    value.push(escaped);
                }
                (i, '"') => break i,
                (_, c) => value.push(c),
            }
        };

        self.rest = &quoted[end + 1..];
        Some((key, value))
    }
}
