use log::debug;
use regex::Regex;

/// Suffix and parenthetical patterns that never belong to the song title itself
const DECORATION_PATTERNS: &[&str] = &[
    // " - Remastered 2011", " - 2011 Remaster", " - Live at Wembley", " - Radio Edit"
    r"(?i)\s+-\s+(\d{4}\s+)?(remaster(ed)?|live|radio edit|single version|mono|stereo|acoustic|demo|bonus track|edit)\b.*$",
    // "(feat. X)", "[ft. X]", "(with X)"
    r"(?i)\s*[\(\[](feat\.?|ft\.?|featuring|with)\s+[^\)\]]*[\)\]]",
    // "(Remastered 2009)", "[Live]", "(Radio Edit)", "(Deluxe Edition)"
    r"(?i)\s*[\(\[][^\)\]]*\b(remaster(ed)?|live|edit|version|deluxe|mono|stereo|bonus)\b[^\)\]]*[\)\]]",
    // trailing "feat. X" without brackets
    r"(?i)\s+(feat\.?|ft\.?|featuring)\s+.*$",
];

/// Strips release decorations from a title so lyric lookups match the song
pub fn clean_track_name(track_name: &str) -> String {
    let mut cleaned = track_name.trim().to_string();
    debug!("Cleaning track name: '{}'", track_name);

    for pattern in DECORATION_PATTERNS {
        if let Ok(re) = Regex::new(pattern) {
            let next = re.replace_all(&cleaned, "").trim().to_string();
            // Never clean a title down to nothing
            if !next.is_empty() {
                cleaned = next;
            }
        }
    }

    if let Ok(spaces) = Regex::new(r"\s{2,}") {
        cleaned = spaces.replace_all(&cleaned, " ").to_string();
    }

    debug!("Cleaned track name: '{}' -> '{}'", track_name, cleaned);
    cleaned
}

/// Drops a leading "Artist - " from titles that repeat the artist
pub fn remove_artist_from_track(track_name: &str, artist_name: &str) -> String {
    let artist = artist_name.trim();
    if artist.is_empty() {
        return track_name.trim().to_string();
    }

    let pattern = format!(r"(?i)^\s*{}\s*[-–—:|]\s*", regex::escape(artist));
    match Regex::new(&pattern) {
        Ok(re) => {
            let stripped = re.replace(track_name, "").trim().to_string();
            if stripped.is_empty() {
                track_name.trim().to_string()
            } else {
                stripped
            }
        }
        Err(_) => track_name.trim().to_string(),
    }
}

/// Lowercase, dash-separated form used in lyric page URLs
pub fn slugify(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}
