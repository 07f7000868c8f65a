//! Managed regions of system configuration files.
//!
//! Each file owned jointly with the operator is split into a preamble, a
//! managed section delimited by fixed marker lines, and a postamble. Only the
//! managed section is regenerated; everything else is carried over byte for
//! byte, except that export lines which would shadow ours are commented out.

use std::collections::BTreeSet;
use std::path::Path;

use volstore_common::fsutil::clean_path;

/// Services covered by the TCP wrappers rules.
pub const NFS_SERVICES: &str = "rpcbind mountd nfsd statd lockd rquotad";

/// Address always allowed to reach the NFS services.
pub const LOOPBACK: &str = "127.0.0.1";

/// Prefix written in front of operator export lines that conflict with ours.
pub const REMOVED_PREFIX: &str = "# volstore removed: ";

/// Export options for every managed export line.
pub const EXPORT_OPTIONS: &str = "rw,no_root_squash,insecure,no_subtree_check,async";

/// Region of `/etc/hosts.allow` and `/etc/hosts.deny`; runs to end of file.
pub const HOSTS_REGION: Region = Region {
    begin: "\n# volstore, do not remove past this line\n",
    end: None,
};

/// Region of `/etc/exports`.
pub const EXPORTS_REGION: Region = Region {
    begin: "\n# --- VOLSTORE EXPORTS BEGIN ---\n# --- Do not edit this section\n",
    end: Some("\n# --- VOLSTORE EXPORTS END ---\n"),
};

/// Marker-delimited section of a text file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Opening marker, including its surrounding newlines.
    pub begin: &'static str,
    /// Closing marker; `None` when the region runs to end of file.
    pub end: Option<&'static str>,
}

/// A file split around a [`Region`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sections<'a> {
    /// Everything before the opening marker.
    pub preamble: &'a str,
    /// Text between the markers.
    pub managed: &'a str,
    /// Everything after the closing marker.
    pub postamble: &'a str,
}

impl Region {
    /// Split `content` around this region.
    ///
    /// Without an opening marker the whole file is preamble. An opening
    /// marker without its closing marker makes the rest of the file managed.
    #[must_use]
    pub fn split<'a>(&self, content: &'a str) -> Sections<'a> {
        let Some((at, len)) = self.find_begin(content) else {
            return Sections {
                preamble: content,
                managed: "",
                postamble: "",
            };
        };
        let preamble = &content[..at];
        let rest = &content[at + len..];

        let (managed, postamble) = match self.end.and_then(|end| Some((end, rest.find(end)?))) {
            Some((end, j)) => (&rest[..j], &rest[j + end.len()..]),
            None => (rest, ""),
        };
        Sections {
            preamble,
            managed,
            postamble,
        }
    }

    // A marker at the very start of the file has no newline in front of it.
    fn find_begin(&self, content: &str) -> Option<(usize, usize)> {
        if let Some(at) = content.find(self.begin) {
            return Some((at, self.begin.len()));
        }
        let bare = self.begin.strip_prefix('\n')?;
        content.starts_with(bare).then_some((0, bare.len()))
    }

    /// Join the three parts back together with fresh markers.
    #[must_use]
    pub fn render(&self, preamble: &str, managed: &str, postamble: &str) -> String {
        let mut out = String::with_capacity(
            preamble.len() + self.begin.len() + managed.len() + postamble.len() + 64,
        );
        out.push_str(preamble);
        out.push_str(self.begin);
        out.push_str(managed);
        if let Some(end) = self.end {
            out.push_str(end);
        }
        out.push_str(postamble);
        out
    }
}

/// The deny rule blocking NFS services for everyone not explicitly allowed.
#[must_use]
pub fn deny_rules() -> String {
    format!("{NFS_SERVICES} : ALL\n\n")
}

/// New `/etc/hosts.deny` contents, or `None` if the deny block is already
/// present verbatim.
#[must_use]
pub fn render_hosts_deny(existing: &str) -> Option<String> {
    let rules = deny_rules();
    let block = format!("{}{rules}", HOSTS_REGION.begin);
    if existing.contains(&block) {
        return None;
    }
    let sections = HOSTS_REGION.split(existing);
    Some(HOSTS_REGION.render(sections.preamble, &rules, ""))
}

/// New `/etc/hosts.allow` contents admitting loopback and `clients`.
///
/// Clients are listed as given, after loopback.
#[must_use]
pub fn render_hosts_allow(existing: &str, clients: &BTreeSet<String>) -> String {
    let hosts = std::iter::once(LOOPBACK)
        .chain(clients.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ");
    let rules = format!("{NFS_SERVICES} : {hosts}\n\n");
    HOSTS_REGION.render(HOSTS_REGION.split(existing).preamble, &rules, "")
}

/// One managed `/etc/exports` line.
#[must_use]
pub fn export_line(mounted: &Path, network: &str) -> String {
    let network = if network == "0.0.0.0/0" { "*" } else { network };
    format!("{}\t{network}({EXPORT_OPTIONS})\n", mounted.display())
}

/// New `/etc/exports` contents with `lines` as the managed section.
///
/// Outside the section, uncommented lines exporting one of `displaced` are
/// commented out.
#[must_use]
pub fn render_exports(existing: &str, lines: &str, displaced: &[&Path]) -> String {
    let sections = EXPORTS_REGION.split(existing);
    EXPORTS_REGION.render(
        &comment_out(sections.preamble, displaced),
        lines,
        &comment_out(sections.postamble, displaced),
    )
}

fn comment_out(text: &str, displaced: &[&Path]) -> String {
    let displaced: Vec<_> = displaced.iter().map(|path| clean_path(path)).collect();
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let conflicts = !trimmed.starts_with('#')
            && trimmed
                .split_whitespace()
                .next()
                .is_some_and(|first| displaced.contains(&clean_path(Path::new(first))));
        if conflicts {
            out.push_str(REMOVED_PREFIX);
        }
        out.push_str(line);
    }
    out
}
