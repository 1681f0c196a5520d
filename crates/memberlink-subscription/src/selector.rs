//! Candidate stream selection policy.

use memberlink_core::StreamCandidate;

/// Pick the next candidate to try.
///
/// `candidates` is ordered oldest to newest and must already exclude
/// candidates known to have failed. Without a previous attempt the newest
/// candidate is offered. Otherwise selection walks towards older candidates
/// and wraps back to the newest after the oldest. The only candidate of a
/// single-entry list is not offered again right after it was attempted.
pub fn next_candidate(
    candidates: &[StreamCandidate],
    previous: Option<&StreamCandidate>,
) -> Option<StreamCandidate> {
    let newest = candidates.last()?;

    let Some(previous) = previous else {
        return Some(newest.clone());
    };

    let next = match candidates.iter().position(|c| c == previous) {
        None => newest,
        Some(0) => newest,
        Some(index) => &candidates[index - 1],
    };

    if next == previous && candidates.len() <= 1 {
        return None;
    }

    Some(next.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(uris: &[&str]) -> Vec<StreamCandidate> {
        uris.iter()
            .map(|uri| StreamCandidate::new(*uri, Vec::new()))
            .collect()
    }

    fn uri(candidate: Option<StreamCandidate>) -> Option<String> {
        candidate.map(|c| c.uri.0)
    }

    #[test]
    fn empty_list_yields_nothing() {
        assert_eq!(next_candidate(&[], None), None);
        let previous = StreamCandidate::new("a", Vec::new());
        assert_eq!(next_candidate(&[], Some(&previous)), None);
    }

    #[test]
    fn newest_is_offered_first() {
        let list = candidates(&["old", "mid", "new"]);
        assert_eq!(uri(next_candidate(&list, None)), Some("new".into()));
    }

    #[test]
    fn walks_towards_older_and_wraps() {
        let list = candidates(&["old", "mid", "new"]);
        assert_eq!(uri(next_candidate(&list, Some(&list[2]))), Some("mid".into()));
        assert_eq!(uri(next_candidate(&list, Some(&list[1]))), Some("old".into()));
        assert_eq!(uri(next_candidate(&list, Some(&list[0]))), Some("new".into()));
    }

    #[test]
    fn vanished_previous_restarts_at_newest() {
        let list = candidates(&["a", "b"]);
        let gone = StreamCandidate::new("gone", Vec::new());
        assert_eq!(uri(next_candidate(&list, Some(&gone))), Some("b".into()));
    }

    #[test]
    fn single_candidate_is_not_repeated() {
        let list = candidates(&["only"]);
        assert_eq!(uri(next_candidate(&list, None)), Some("only".into()));
        assert_eq!(next_candidate(&list, Some(&list[0])), None);
    }

    #[test]
    fn result_is_always_member_of_input() {
        let list = candidates(&["a", "b", "c", "d"]);
        let outsider = StreamCandidate::new("z", Vec::new());
        let previous_options: Vec<Option<&StreamCandidate>> = list
            .iter()
            .map(Some)
            .chain([None, Some(&outsider)])
            .collect();

        for len in 1..=list.len() {
            let slice = &list[..len];
            for previous in &previous_options {
                match next_candidate(slice, *previous) {
                    Some(next) => assert!(slice.contains(&next)),
                    None => {
                        assert_eq!(len, 1);
                        assert_eq!(*previous, Some(&slice[0]));
                    }
                }
            }
        }
    }
}
