//! Incremental removal of `<artifact ...>...</artifact>` spans from streamed text.
//!
//! Prose is emitted as soon as it can no longer be the start of a marker. Bytes that
//! might still turn into markup stay in the carry-over buffer until a later delta
//! resolves them, so a marker split across chunks never leaks into visible output.

use tracing::debug;

const OPEN_MARKER: &str = "<artifact";
const CLOSE_MARKER: &str = "</artifact>";

/// A complete `<artifact ...>body</artifact>` span seen in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawArtifactBlock {
    /// `<artifact` through the first `>`.
    pub open_tag: String,
    pub body: String,
}

impl RawArtifactBlock {
    fn from_span(span: &str) -> Self {
        match span.find('>') {
            Some(i) => Self {
                open_tag: span[..=i].to_string(),
                body: span[i + 1..].to_string(),
            },
            None => Self {
                open_tag: span.to_string(),
                body: String::new(),
            },
        }
    }
}

/// Output of one [`ArtifactStripper::process`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stripped {
    pub visible: String,
    pub blocks: Vec<RawArtifactBlock>,
}

/// Per-stream filter state. Create one per response.
#[derive(Debug, Default)]
pub struct ArtifactStripper {
    buffer: String,
    inside: bool,
    // Bytes of `buffer` already searched for the closing marker.
    scanned: usize,
}

impl ArtifactStripper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_inside_block(&self) -> bool {
        self.inside
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub fn process(&mut self, delta: &str) -> Stripped {
        let mut out = Stripped::default();
        self.buffer.push_str(delta);

        while !self.buffer.is_empty() {
            if !self.inside {
                match self.buffer.find(OPEN_MARKER) {
                    Some(start) => {
                        out.visible.push_str(&self.buffer[..start]);
                        self.buffer.drain(..start);
                        self.inside = true;
                        self.scanned = 0;
                    }
                    None => {
                        let emit = self.buffer.len() - partial_marker_len(&self.buffer);
                        out.visible.push_str(&self.buffer[..emit]);
                        self.buffer.drain(..emit);
                        break;
                    }
                }
            } else {
                let from = self.close_search_start();
                let Some(rel) = self.buffer[from..].find(CLOSE_MARKER) else {
                    self.scanned = self.buffer.len();
                    break;
                };
                let end = from + rel;
                let block: String = self.buffer.drain(..end + CLOSE_MARKER.len()).collect();
                out.blocks.push(RawArtifactBlock::from_span(&block[..end]));
                self.inside = false;
                self.scanned = 0;
            }
        }

        out
    }

    /// Ends the stream. Held-back prose is flushed; an unterminated block is lost.
    pub fn finish(&mut self) -> Stripped {
        let rest = std::mem::take(&mut self.buffer);
        let inside = std::mem::replace(&mut self.inside, false);
        self.scanned = 0;
        if inside {
            debug!(dropped_bytes = rest.len(), "stream ended inside an artifact block");
            return Stripped::default();
        }
        Stripped { visible: rest, blocks: Vec::new() }
    }

    fn close_search_start(&self) -> usize {
        let mut from = self.scanned.saturating_sub(CLOSE_MARKER.len() - 1);
        while !self.buffer.is_char_boundary(from) {
            from -= 1;
        }
        from
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of the opening marker.
fn partial_marker_len(text: &str) -> usize {
    (1..OPEN_MARKER.len())
        .rev()
        .find(|&k| text.ends_with(&OPEN_MARKER[..k]))
        .unwrap_or(0)
}

/// Runs a whole text through a fresh stripper.
pub fn strip_all(text: &str) -> Stripped {
    let mut stripper = ArtifactStripper::new();
    let mut out = stripper.process(text);
    let tail = stripper.finish();
    out.visible.push_str(&tail.visible);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_chunks(chunks: &[&str]) -> Stripped {
        let mut s = ArtifactStripper::new();
        let mut all = Stripped::default();
        for c in chunks {
            let out = s.process(c);
            all.visible.push_str(&out.visible);
            all.blocks.extend(out.blocks);
        }
        let tail = s.finish();
        all.visible.push_str(&tail.visible);
        all
    }

    #[test]
    fn marker_split_across_chunks_does_not_leak() {
        let mut s = ArtifactStripper::new();
        let first = s.process("Hello <art");
        assert_eq!(first.visible, "Hello ");
        assert!(first.blocks.is_empty());
        let second = s.process("ifact>ignored</artifact> world");
        assert_eq!(second.visible, " world");
        assert_eq!(second.blocks.len(), 1);
        assert_eq!(second.blocks[0].body, "ignored");
        assert_eq!(format!("{}{}", first.visible, second.visible), "Hello  world");
    }

    #[test]
    fn unterminated_block_is_dropped_at_finish() {
        let mut s = ArtifactStripper::new();
        let out = s.process("Here you go: <artifact><title>X</title>");
        assert_eq!(out.visible, "Here you go: ");
        assert!(s.is_inside_block());
        let tail = s.finish();
        assert_eq!(tail, Stripped::default());
        assert!(!s.is_inside_block());
        assert!(s.pending().is_empty());
    }

    #[test]
    fn attributes_stay_in_open_tag() {
        let out = strip_all(r#"a<artifact type="code" language="python" title="Hi">print(1)</artifact>b"#);
        assert_eq!(out.visible, "ab");
        assert_eq!(out.blocks[0].open_tag, r#"<artifact type="code" language="python" title="Hi">"#);
        assert_eq!(out.blocks[0].body, "print(1)");
    }

    #[test]
    fn held_back_prefix_is_released_when_it_turns_out_to_be_prose() {
        let mut s = ArtifactStripper::new();
        assert_eq!(s.process("x <a").visible, "x ");
        assert_eq!(s.process("bc").visible, "<abc");
        assert_eq!(s.process("tail <").visible, "tail ");
        assert_eq!(s.finish().visible, "<");
    }

    #[test]
    fn closing_marker_split_across_chunks() {
        let out = run_chunks(&["pre <artifact>co", "de</arti", "fact>post"]);
        assert_eq!(out.visible, "pre post");
        assert_eq!(out.blocks.len(), 1);
        assert_eq!(out.blocks[0].body, "code");
    }

    #[test]
    fn two_blocks_in_one_chunk() {
        let out = strip_all("a<artifact>1</artifact>b<artifact>2</artifact>c");
        assert_eq!(out.visible, "abc");
        let bodies: Vec<_> = out.blocks.iter().map(|b| b.body.as_str()).collect();
        assert_eq!(bodies, vec!["1", "2"]);
    }

    #[test]
    fn visible_output_is_independent_of_chunking() {
        let inputs = [
            "plain prose with < and > but no markup, ünïcödé too",
            "Intro <artifact language=\"rust\" title=\"T\">fn main() {}</artifact> outro",
            "A<artifact>x</artifact>B <artifact title=\"é\">y\n</artifact>C <arti",
        ];
        for input in inputs {
            let whole = strip_all(input);
            let bounds: Vec<usize> = input
                .char_indices()
                .map(|(i, _)| i)
                .chain(std::iter::once(input.len()))
                .collect();
            for &i in &bounds {
                for &j in bounds.iter().filter(|&&j| j >= i) {
                    let split = run_chunks(&[&input[..i], &input[i..j], &input[j..]]);
                    assert_eq!(split.visible, whole.visible, "split at {i},{j} of {input:?}");
                    assert_eq!(split.blocks, whole.blocks, "split at {i},{j} of {input:?}");
                }
            }
        }
    }

    #[test]
    fn char_by_char_matches_single_chunk() {
        let input = "x<artifact language=\"py\">print('hi')</artifact>y";
        let chars: Vec<String> = input.chars().map(|c| c.to_string()).collect();
        let refs: Vec<&str> = chars.iter().map(String::as_str).collect();
        assert_eq!(run_chunks(&refs), strip_all(input));
    }
}
