//! Fuzzy matching for command suggestions and address-book lookups.

use crate::models::Address;

/// Case-sensitive edit distance, two-row implementation.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();

    if a_chars.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a_chars.len();
    }

    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, a_ch) in a_chars.iter().enumerate() {
        curr[0] = i + 1;
        for (j, b_ch) in b_chars.iter().enumerate() {
            let cost = usize::from(a_ch != b_ch);
            curr[j + 1] = (curr[j] + 1).min(prev[j + 1] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_chars.len()]
}

/// Similarity of two strings on a 0..=100 scale.
pub fn ratio(a: &str, b: &str) -> u32 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 100;
    }
    let dist = levenshtein(a, b);
    (100 * (longest - dist.min(longest)) / longest) as u32
}

/// Best similarity of `needle` against any same-length window of `haystack`,
/// 0..=100. Lets a short search term score highly against a long serialized
/// record, like a partial-ratio match.
pub fn partial_ratio(needle: &str, haystack: &str) -> u32 {
    let needle: Vec<char> = needle.to_lowercase().chars().collect();
    let haystack: Vec<char> = haystack.to_lowercase().chars().collect();
    if needle.is_empty() {
        return 0;
    }
    if haystack.len() <= needle.len() {
        let n: String = needle.iter().collect();
        let h: String = haystack.iter().collect();
        return ratio(&n, &h);
    }

    let n: String = needle.iter().collect();
    let mut best = 0;
    for window in haystack.windows(needle.len()) {
        let w: String = window.iter().collect();
        best = best.max(ratio(&n, &w));
        if best == 100 {
            break;
        }
    }
    best
}

/// Closest registered command to an unrecognized token. No score floor:
/// there is always a best suggestion.
pub fn closest_command<'a>(input: &str, candidates: &[&'a str]) -> Option<&'a str> {
    let input = input.to_lowercase();
    candidates
        .iter()
        .map(|cand| {
            let mut score = ratio(&input, cand);
            // A containment match (typo'd prefix, truncated command) beats
            // pure edit distance.
            if cand.contains(&input) || input.contains(*cand) {
                score = score.max(90);
            }
            (score, *cand)
        })
        .max_by_key(|(score, _)| *score)
        .map(|(_, cand)| cand)
}

/// Score threshold below which an address search is "no good match".
pub const ADDRESS_MATCH_THRESHOLD: u32 = 50;

fn serialize_address(address: &Address) -> String {
    let mut fields = vec![
        address.addressee.as_str(),
        address.line1.as_str(),
    ];
    if let Some(line2) = &address.line2 {
        fields.push(line2);
    }
    fields.push(&address.city);
    fields.push(&address.postal_code);
    fields.push(&address.country);
    fields.join(" ")
}

/// Index of the address book entry closest to the search term, or `None`
/// when even the best score stays at or below the threshold.
pub fn closest_address_index(query: &str, address_book: &[Address]) -> Option<usize> {
    address_book
        .iter()
        .enumerate()
        .map(|(idx, addr)| (partial_ratio(query, &serialize_address(addr)), idx))
        .max_by_key(|(score, _)| *score)
        .filter(|(score, _)| *score > ADDRESS_MATCH_THRESHOLD)
        .map(|(_, idx)| idx)
}
