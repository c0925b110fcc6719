//! The `node1,node2,bandwidth` topology interchange format.

use tracing::warn;

use crate::network::topology::TopologyError;
use crate::network::types::{Link, NodeName};
use crate::units::Mbps;

/// Parses topology CSV contents into links.
///
/// Blank lines and lines without exactly three fields are skipped silently;
/// a non-integer bandwidth skips the line with a warning; an unrecognized
/// node-name prefix is an error.
pub fn parse_links(contents: &str) -> Result<Vec<Link>, TopologyError> {
    let mut links = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields = line.split(',').map(str::trim).collect::<Vec<_>>();
        let [n1, n2, bw] = fields[..] else {
            continue;
        };
        let a = n1.parse::<NodeName>()?;
        let b = n2.parse::<NodeName>()?;
        let capacity = match bw.parse::<u64>() {
            Ok(bw) => Mbps::new(bw),
            Err(_) => {
                warn!(line, "skipping link with non-integer bandwidth");
                continue;
            }
        };
        links.push(Link::new(a, b, capacity));
    }
    Ok(links)
}

/// Formats links as topology CSV, one `node1,node2,bandwidth` line per link.
pub fn format_links<I>(links: I) -> String
where
    I: IntoIterator<Item = Link>,
{
    let mut out = String::new();
    for Link { a, b, capacity } in links {
        out.push_str(&format!("{a},{b},{}\n", capacity.into_u64()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_lines() -> anyhow::Result<()> {
        let csv = "h1,s1,100\n s1 , s2 , 60 \n";
        let links = parse_links(csv)?;
        assert_eq!(links.len(), 2);
        assert_eq!(links[0], Link::new("h1".parse()?, "s1".parse()?, Mbps::new(100)));
        assert_eq!(links[1], Link::new("s1".parse()?, "s2".parse()?, Mbps::new(60)));
        Ok(())
    }

    #[test]
    fn skips_blank_short_and_non_integer_lines() -> anyhow::Result<()> {
        let csv = "\nh1,s1\nh1,s1,100\ns1,s2,fast\ns1,s2,60,extra\n";
        let links = parse_links(csv)?;
        assert_eq!(links.len(), 1);
        Ok(())
    }

    #[test]
    fn rejects_unknown_prefix() {
        assert!(parse_links("x1,s1,100\n").is_err());
    }

    #[test]
    fn round_trips() -> anyhow::Result<()> {
        let csv = "h1,s1,100\nh2,s2,100\ns1,s2,60\n";
        let links = parse_links(csv)?;
        assert_eq!(format_links(links), csv);
        Ok(())
    }
}
