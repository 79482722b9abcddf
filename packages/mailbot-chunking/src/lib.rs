use unicode_segmentation::UnicodeSegmentation;

#[derive(Clone, Debug)]
pub struct ChunkingConfig {
	pub window_chars: u32,
	pub overlap_chars: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
	pub chunk_index: u32,
	pub start_offset: usize,
	pub end_offset: usize,
	pub text: String,
}

/// Splits `text` into overlapping windows measured in grapheme clusters.
///
/// A window that would cut a word ends early on the last whitespace within its final quarter.
/// Windows holding only whitespace are skipped and do not consume a chunk index.
pub fn split_text(text: &str, cfg: &ChunkingConfig) -> Vec<Chunk> {
	let window = cfg.window_chars as usize;

	if window == 0 {
		return Vec::new();
	}

	let overlap = (cfg.overlap_chars as usize).min(window - 1);
	let graphemes: Vec<(usize, &str)> = text.grapheme_indices(true).collect();
	let total = graphemes.len();
	let byte_at = |idx: usize| graphemes.get(idx).map(|(offset, _)| *offset).unwrap_or(text.len());
	let mut chunks = Vec::new();
	let mut start = 0_usize;
	let mut chunk_index = 0_u32;

	while start < total {
		let mut end = (start + window).min(total);

		if end < total
			&& let Some(cut) = whitespace_cut(&graphemes, start, end, window)
		{
			end = cut;
		}

		let start_offset = byte_at(start);
		let end_offset = byte_at(end);
		let slice = &text[start_offset..end_offset];

		if !slice.trim().is_empty() {
			chunks.push(Chunk { chunk_index, start_offset, end_offset, text: slice.to_string() });

			chunk_index += 1;
		}
		if end >= total {
			break;
		}

		start = end.saturating_sub(overlap).max(start + 1);
	}

	chunks
}

fn whitespace_cut(
	graphemes: &[(usize, &str)],
	start: usize,
	end: usize,
	window: usize,
) -> Option<usize> {
	let floor = end.saturating_sub(window / 4).max(start + 1);

	(floor..end)
		.rev()
		.find(|idx| graphemes[*idx].1.chars().all(char::is_whitespace))
		.map(|idx| idx + 1)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cfg(window_chars: u32, overlap_chars: u32) -> ChunkingConfig {
		ChunkingConfig { window_chars, overlap_chars }
	}

	#[test]
	fn short_text_is_a_single_chunk() {
		let chunks = split_text("We are open 9am-5pm ET", &cfg(1_200, 200));

		assert_eq!(chunks.len(), 1);
		assert_eq!(chunks[0].text, "We are open 9am-5pm ET");
		assert_eq!(chunks[0].chunk_index, 0);
	}

	#[test]
	fn windows_overlap_without_whitespace() {
		let chunks = split_text("abcdefghijklmnopqrstuvwxyz", &cfg(10, 3));
		let texts: Vec<&str> = chunks.iter().map(|chunk| chunk.text.as_str()).collect();

		assert_eq!(texts, vec!["abcdefghij", "hijklmnopq", "opqrstuvwx", "vwxyz"]);
	}

	#[test]
	fn windows_end_on_whitespace() {
		let chunks = split_text("alpha beta gamma delta", &cfg(12, 0));
		let texts: Vec<&str> = chunks.iter().map(|chunk| chunk.text.as_str()).collect();

		assert_eq!(texts, vec!["alpha beta ", "gamma delta"]);
	}

	#[test]
	fn whitespace_only_windows_are_skipped() {
		assert!(split_text("     ", &cfg(4, 1)).is_empty());

		let chunks = split_text("ab        cd", &cfg(4, 0));
		let indexes: Vec<u32> = chunks.iter().map(|chunk| chunk.chunk_index).collect();

		assert_eq!(indexes, vec![0, 1]);
		assert_eq!(chunks[1].text, "  cd");
	}

	#[test]
	fn offsets_respect_multibyte_text() {
		let text = "héllo wörld ünïcode façade";
		let chunks = split_text(text, &cfg(7, 2));

		assert!(chunks.len() > 1);

		for chunk in &chunks {
			assert_eq!(text.get(chunk.start_offset..chunk.end_offset), Some(chunk.text.as_str()));
		}

		assert_eq!(chunks.last().map(|chunk| chunk.end_offset), Some(text.len()));
	}

	#[test]
	fn splitting_is_deterministic() {
		let text = "One sentence. Another sentence that runs a little longer. A third.";

		assert_eq!(split_text(text, &cfg(20, 5)), split_text(text, &cfg(20, 5)));
	}
}
