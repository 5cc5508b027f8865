use tracing::debug;

/// A local spectrogram maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peak {
    pub freq: usize,
    pub time: usize,
}

/// Row-major grid indexed `[freq][time]`.
struct Grid<T> {
    rows: usize,
    cols: usize,
    cells: Vec<T>,
}

impl<T: Copy> Grid<T> {
    fn from_rows(rows: &[Vec<T>], fill: T) -> Self {
        let cols = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut cells = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            cells.extend_from_slice(row);
            cells.extend(std::iter::repeat_n(fill, cols - row.len()));
        }
        Self {
            rows: rows.len(),
            cols,
            cells,
        }
    }

    fn map<U>(&self, f: impl Fn(T) -> U) -> Grid<U> {
        Grid {
            rows: self.rows,
            cols: self.cols,
            cells: self.cells.iter().map(|&c| f(c)).collect(),
        }
    }

    /// One pass over the 4-connected cross. Out-of-range neighbours read as
    /// `border`. Iterating `r` times covers the diamond of radius `r`.
    fn cross_pass(&self, border: Option<T>, combine: impl Fn(T, T) -> T) -> Grid<T> {
        let mut out = Vec::with_capacity(self.cells.len());
        for r in 0..self.rows {
            for c in 0..self.cols {
                let idx = r * self.cols + c;
                let mut acc = self.cells[idx];
                let neighbours = [
                    (r > 0).then(|| idx - self.cols),
                    (r + 1 < self.rows).then(|| idx + self.cols),
                    (c > 0).then(|| idx - 1),
                    (c + 1 < self.cols).then(|| idx + 1),
                ];
                for neighbour in neighbours {
                    match (neighbour, border) {
                        (Some(n), _) => acc = combine(acc, self.cells[n]),
                        (None, Some(b)) => acc = combine(acc, b),
                        (None, None) => {}
                    }
                }
                out.push(acc);
            }
        }
        Grid {
            rows: self.rows,
            cols: self.cols,
            cells: out,
        }
    }
}

fn maximum_filter(grid: &Grid<f64>, radius: usize) -> Grid<f64> {
    let mut filtered = grid.map(|v| v);
    for _ in 0..radius {
        filtered = filtered.cross_pass(None, f64::max);
    }
    filtered
}

/// Binary erosion with cells outside the grid treated as set.
fn erode(mask: &Grid<bool>, radius: usize) -> Grid<bool> {
    let mut eroded = mask.map(|v| v);
    for _ in 0..radius {
        eroded = eroded.cross_pass(Some(true), |a, b| a && b);
    }
    eroded
}

/// Finds cells equal to the maximum of their diamond neighbourhood, minus
/// flat all-zero background, with amplitude strictly above `amp_min`.
///
/// Peaks come out frequency-major; `sort_by_time` applies a stable sort on
/// the frame index.
pub fn find_peaks_2d(
    rows: &[Vec<f64>],
    neighborhood: usize,
    amp_min: f64,
    sort_by_time: bool,
) -> Vec<Peak> {
    let grid = Grid::from_rows(rows, 0.0);
    if grid.cells.is_empty() {
        return Vec::new();
    }

    let local_max = maximum_filter(&grid, neighborhood);
    let background = grid.map(|v| v == 0.0);
    let eroded_background = erode(&background, neighborhood);

    let mut peaks: Vec<Peak> = (0..grid.cells.len())
        .filter(|&idx| {
            let is_max = grid.cells[idx] == local_max.cells[idx];
            is_max != eroded_background.cells[idx] && grid.cells[idx] > amp_min
        })
        .map(|idx| Peak {
            freq: idx / grid.cols,
            time: idx % grid.cols,
        })
        .collect();

    if sort_by_time {
        peaks.sort_by_key(|peak| peak.time);
    }

    debug!(peaks = peaks.len(), "Extracted spectral peaks");
    peaks
}
