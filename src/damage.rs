/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Damage tracking: coalesced byte intervals marking changed regions of a buffer */

/* Gaps smaller than this are cheaper to retransmit than to track */
pub const DAMAGE_MIN_GAP: usize = 256;

/** Damaged region of a replicated buffer, as a sorted list of disjoint
 * half-open byte intervals, or the sentinel marking a full resend. */
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Damage {
    Nothing,
    Everything,
    Intervals(Vec<(usize, usize)>),
}

impl Damage {
    pub fn is_empty(&self) -> bool {
        match self {
            Damage::Nothing => true,
            Damage::Everything => false,
            Damage::Intervals(v) => v.is_empty(),
        }
    }

    /** Union a new interval into the damage; `None` means "all" */
    pub fn add(&mut self, interval: Option<(usize, usize)>) {
        let Some(intv) = interval else {
            *self = Damage::Everything;
            return;
        };
        if intv.1 <= intv.0 {
            return;
        }
        match self {
            Damage::Everything => {}
            Damage::Nothing => {
                *self = Damage::Intervals(vec![intv]);
            }
            Damage::Intervals(v) => {
                *self = Damage::Intervals(union_damage(v, &[intv], DAMAGE_MIN_GAP));
            }
        }
    }

    /** The damaged intervals clipped to `[0, size)`, with edges rounded
     * outward to 64-byte diff block boundaries. Returns an empty list iff
     * there is no damage. */
    pub fn aligned_intervals(&self, size: usize) -> Vec<(usize, usize)> {
        let bound = crate::util::align(size, 64);
        match self {
            Damage::Nothing => Vec::new(),
            Damage::Everything => {
                if size == 0 {
                    Vec::new()
                } else {
                    vec![(0, bound)]
                }
            }
            Damage::Intervals(v) => {
                let rounded: Vec<(usize, usize)> = v
                    .iter()
                    .filter(|x| x.0 < size)
                    .map(|x| (64 * (x.0 / 64), std::cmp::min(crate::util::align(x.1, 64), bound)))
                    .collect();
                if rounded.is_empty() {
                    return rounded;
                }
                /* Rounding may have joined adjacent intervals */
                let mut output = Vec::new();
                let mut cur = rounded[0];
                for r in &rounded[1..] {
                    if r.0 <= cur.1 {
                        cur.1 = std::cmp::max(cur.1, r.1);
                    } else {
                        output.push(cur);
                        cur = *r;
                    }
                }
                output.push(cur);
                output
            }
        }
    }
}

/* Given two sorted lists of disjoint intervals, compute their union,
 * automatically closing any gaps of size < min_gap in the process. Panics if
 * validation fails, as this should be an invariant. */
pub fn union_damage(
    a: &[(usize, usize)],
    b: &[(usize, usize)],
    min_gap: usize,
) -> Vec<(usize, usize)> {
    debug_assert!(validate_intervals(a, min_gap).is_ok());

    let mut output = Vec::new();

    let mut iter_a = a.iter().peekable();
    let mut iter_b = b.iter().peekable();

    let mut last: Option<(usize, usize)> = None;
    loop {
        // Extract element with next earliest endpoint from either of A or B
        let pa = iter_a.peek();
        let pb = iter_b.peek();

        let nxt = *match (pa, pb) {
            (Some(ea), Some(eb)) => {
                if ea.0 <= eb.0 {
                    iter_a.next().unwrap()
                } else {
                    iter_b.next().unwrap()
                }
            }
            (Some(_), None) => iter_a.next().unwrap(),
            (None, Some(_)) => iter_b.next().unwrap(),
            (None, None) => {
                break;
            }
        };

        let Some(mut y) = last else {
            last = Some(nxt);
            continue;
        };

        // Merge intervals or push old
        if nxt.0 <= y.1 || (nxt.0 - y.1) < min_gap {
            y.1 = std::cmp::max(y.1, nxt.1);
            last = Some(y);
        } else {
            output.push(y);
            last = Some(nxt);
        }
    }
    if let Some(e) = last {
        output.push(e);
    }

    output
}

fn validate_intervals(a: &[(usize, usize)], min_gap: usize) -> Result<(), String> {
    for (x, y) in a {
        if x >= y {
            return Err(format!("negative or empty interval {} {}", x, y));
        }
    }
    for i in 1..a.len() {
        if a[i].0 < a[i - 1].1 {
            return Err(format!("overlapping {:?} {:?}", a[i - 1], a[i]));
        }
        if a[i].0 < a[i - 1].1 + min_gap {
            return Err(format!(
                "min gap too small {}-{}={} < {}",
                a[i].0,
                a[i - 1].1,
                a[i].0 - a[i - 1].1,
                min_gap
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_damage() {
        let x: &[(usize, usize)] = &[(0, 6)];
        let y: &[(usize, usize)] = &[(8, 10), (300, 320)];
        assert!(validate_intervals(x, 4).is_ok());

        let bad1: &[(usize, usize)] = &[(8, 10), (11, 20)];
        let bad2: &[(usize, usize)] = &[(8, 10), (6, 20)];
        assert!(validate_intervals(bad1, 4).is_err());
        assert!(validate_intervals(bad2, 4).is_err());

        let output = union_damage(x, y, 4);
        assert_eq!(&output, &[(0, 10), (300, 320)]);

        /* A huge min_gap merges everything */
        let output = union_damage(x, y, usize::MAX);
        assert_eq!(&output, &[(0, 320)]);
    }

    #[test]
    fn test_damage_insertion() {
        let mut d = Damage::Nothing;
        assert!(d.is_empty());
        d.add(Some((100, 200)));
        d.add(Some((400, 400))); /* empty, ignored */
        assert_eq!(d, Damage::Intervals(vec![(100, 200)]));
        /* gap of less than DAMAGE_MIN_GAP closes */
        d.add(Some((300, 500)));
        assert_eq!(d, Damage::Intervals(vec![(100, 500)]));
        d.add(Some((2000, 2100)));
        assert_eq!(d, Damage::Intervals(vec![(100, 500), (2000, 2100)]));
        d.add(None);
        assert_eq!(d, Damage::Everything);
        assert!(!d.is_empty());
    }

    #[test]
    fn test_aligned_intervals() {
        let d = Damage::Intervals(vec![(10, 70), (130, 200)]);
        /* rounding outward joins the two intervals */
        assert_eq!(d.aligned_intervals(1000), vec![(0, 256)]);

        let d = Damage::Intervals(vec![(10, 70), (1000, 1100)]);
        assert_eq!(d.aligned_intervals(1000), vec![(0, 128)]);

        let d = Damage::Everything;
        assert_eq!(d.aligned_intervals(100), vec![(0, 128)]);
        assert_eq!(d.aligned_intervals(0), Vec::<(usize, usize)>::new());

        assert_eq!(
            Damage::Nothing.aligned_intervals(4096),
            Vec::<(usize, usize)>::new()
        );
    }
}
