//! Compact packets: the per-node digest a reflection prompt is built from.
//!
//! Full bodies do not fit a cluster budget; a packet keeps the head of the
//! body, the tail of the `## Updates` section, and a handful of links.

use omg_graph::Node;
use omg_llm::estimate_tokens;

const MAX_SUMMARY_LINES: usize = 10;
const MAX_RECENT_UPDATES: usize = 3;
const MAX_KEY_LINKS: usize = 5;

#[derive(Debug, Clone)]
pub struct CompactPacket {
    pub id: String,
    pub canonical_key: String,
    pub node_type: String,
    pub description: String,
    pub summary_lines: Vec<String>,
    pub recent_updates: Vec<String>,
    pub key_links: Vec<String>,
}

impl CompactPacket {
    pub fn estimated_tokens(&self) -> u64 {
        estimate_tokens(&self.render())
    }

    /// One fenced block per packet.
    pub fn render(&self) -> String {
        let mut out = String::from("```packet\n");
        out.push_str(&format!("id: {}\n", self.id));
        out.push_str(&format!("key: {}\n", self.canonical_key));
        out.push_str(&format!("type: {}\n", self.node_type));
        out.push_str(&format!("description: {}\n", self.description));
        if !self.key_links.is_empty() {
            out.push_str(&format!("links: {}\n", self.key_links.join(", ")));
        }
        if !self.summary_lines.is_empty() {
            out.push_str("summary:\n");
            for line in &self.summary_lines {
                out.push_str(&format!("  {line}\n"));
            }
        }
        if !self.recent_updates.is_empty() {
            out.push_str("recent-updates:\n");
            for update in &self.recent_updates {
                out.push_str(&format!("  - {update}\n"));
            }
        }
        out.push_str("```\n");
        out
    }
}

pub fn build_packet(node: &Node) -> CompactPacket {
    CompactPacket {
        id: node.header.id.clone(),
        canonical_key: node
            .header
            .canonical_key
            .clone()
            .unwrap_or_else(|| node.header.id.clone()),
        node_type: node.header.node_type.slug().to_string(),
        description: node.header.description.clone(),
        summary_lines: summary_lines(&node.body),
        recent_updates: recent_updates(&node.body),
        key_links: node
            .header
            .links
            .as_deref()
            .unwrap_or_default()
            .iter()
            .take(MAX_KEY_LINKS)
            .cloned()
            .collect(),
    }
}

pub fn render_packets(packets: &[CompactPacket]) -> String {
    packets.iter().map(CompactPacket::render).collect::<Vec<_>>().join("\n")
}

/// First non-empty body lines, stopping at the `## Updates` heading.
fn summary_lines(body: &str) -> Vec<String> {
    body.lines()
        .take_while(|line| !is_updates_heading(line))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(MAX_SUMMARY_LINES)
        .map(str::to_string)
        .collect()
}

/// Last bullets under the `## Updates` heading.
fn recent_updates(body: &str) -> Vec<String> {
    let mut in_updates = false;
    let mut bullets = Vec::new();
    for line in body.lines() {
        if is_updates_heading(line) {
            in_updates = true;
            continue;
        }
        if in_updates {
            // The next heading ends the section.
            if line.trim_start().starts_with('#') {
                break;
            }
            let trimmed = line.trim();
            if let Some(bullet) = trimmed.strip_prefix("- ").or_else(|| trimmed.strip_prefix("* "))
            {
                bullets.push(bullet.trim().to_string());
            }
        }
    }
    if bullets.len() > MAX_RECENT_UPDATES {
        bullets.split_off(bullets.len() - MAX_RECENT_UPDATES)
    } else {
        bullets
    }
}

fn is_updates_heading(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed
        .strip_prefix("##")
        .map(|rest| rest.trim().eq_ignore_ascii_case("updates"))
        .unwrap_or(false)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use omg_graph::{NodeHeader, NodeType, Priority};

    use super::*;

    fn node(body: &str, links: Option<Vec<String>>) -> Node {
        let mut header = NodeHeader::new(
            "omg/project/garden",
            "Garden project status",
            NodeType::Project,
            Priority::Medium,
            Utc::now(),
        );
        header.canonical_key = Some("projects.garden".to_string());
        header.links = links;
        Node {
            header,
            body: body.to_string(),
            path: std::path::PathBuf::from("nodes/project/garden.md"),
        }
    }

    #[test]
    fn packet_caps_summary_at_ten_lines() {
        let body = (1..=15).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let packet = build_packet(&node(&body, None));
        assert_eq!(packet.summary_lines.len(), 10);
        assert_eq!(packet.summary_lines[0], "line 1");
        assert_eq!(packet.summary_lines[9], "line 10");
    }

    #[test]
    fn packet_takes_last_three_update_bullets() {
        let body = "Intro line.\n\n## Updates\n- first\n- second\n- third\n- fourth\n- fifth\n";
        let packet = build_packet(&node(body, None));
        assert_eq!(packet.recent_updates, vec!["third", "fourth", "fifth"]);
        // Summary stops before the heading.
        assert_eq!(packet.summary_lines, vec!["Intro line."]);
    }

    #[test]
    fn updates_section_ends_at_next_heading() {
        let body = "## Updates\n- inside\n\n## Other\n- outside\n";
        let packet = build_packet(&node(body, None));
        assert_eq!(packet.recent_updates, vec!["inside"]);
    }

    #[test]
    fn packet_caps_links_at_five() {
        let links: Vec<String> = (0..8).map(|i| format!("omg/fact/{i}")).collect();
        let packet = build_packet(&node("body", Some(links)));
        assert_eq!(packet.key_links.len(), 5);
    }

    #[test]
    fn render_is_a_fenced_block() {
        let packet = build_packet(&node("some body", None));
        let rendered = packet.render();
        assert!(rendered.starts_with("```packet\n"));
        assert!(rendered.trim_end().ends_with("```"));
        assert!(rendered.contains("id: omg/project/garden"));
        assert!(rendered.contains("key: projects.garden"));
        assert!(packet.estimated_tokens() > 0);
    }

    #[test]
    fn blank_lines_are_skipped_in_summary() {
        let packet = build_packet(&node("\n\nfirst\n\n\nsecond\n", None));
        assert_eq!(packet.summary_lines, vec!["first", "second"]);
    }
}
