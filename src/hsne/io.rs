//! Binary persistence of a hierarchy.
//!
//! Layout (little endian): major and minor version (`u32`, both 0), number
//! of scales (`u32`), then every scale. Scale 0 stores its size and its
//! transition matrix; the other scales store size, transition matrix,
//! landmark → original data, landmark → previous scale, landmark weights,
//! previous scale → landmark (`i32`, -1 for regular points) and the area of
//! influence. Sparse matrices are the number of rows followed by, per row,
//! the number of entries and `(u32 index, f64 value)` pairs. Vectors are
//! their length followed by the values.

use num_traits::{Float, FromPrimitive, ToPrimitive};
use std::io::{ErrorKind, Read, Write};
use std::ops::AddAssign;

use crate::data::structures::*;
use crate::error::{HsneError, Result};
use crate::hsne::{HierarchicalSne, HsneParams, Scale};

const MAJOR_VERSION: u32 = 0;
const MINOR_VERSION: u32 = 0;

/// Marks a previous-scale point that is not a landmark
const NOT_A_LANDMARK: i32 = -1;

/// Upper bound on buffers sized from counts read off the stream
const MAX_PREALLOC: usize = 1 << 16;

////////////////
// Primitives //
////////////////

fn read_error(err: std::io::Error) -> HsneError {
    if err.kind() == ErrorKind::UnexpectedEof {
        HsneError::Runtime("Unexpected end of the serialised hierarchy".to_string())
    } else {
        HsneError::Io(err)
    }
}

fn to_u32(v: usize, what: &str) -> Result<u32> {
    u32::try_from(v).map_err(|_| {
        HsneError::InvalidArgument(format!("{} {} does not fit the file format", what, v))
    })
}

fn write_u32<W: Write>(writer: &mut W, v: u32) -> Result<()> {
    writer.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_f64<W: Write>(writer: &mut W, v: f64) -> Result<()> {
    writer.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0_u8; 4];
    reader.read_exact(&mut buf).map_err(read_error)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32> {
    let mut buf = [0_u8; 4];
    reader.read_exact(&mut buf).map_err(read_error)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_f64<R: Read>(reader: &mut R) -> Result<f64> {
    let mut buf = [0_u8; 8];
    reader.read_exact(&mut buf).map_err(read_error)?;
    Ok(f64::from_le_bytes(buf))
}

fn to_f64<T: ToPrimitive>(v: T) -> f64 {
    v.to_f64().unwrap_or(f64::NAN)
}

fn from_f64<T: FromPrimitive + Float>(v: f64) -> T {
    T::from_f64(v).unwrap_or_else(T::nan)
}

/////////////
// Vectors //
/////////////

/// Write a vector of indices
pub fn save_uint_vector<W: Write>(vector: &[usize], writer: &mut W) -> Result<()> {
    write_u32(writer, to_u32(vector.len(), "Vector length")?)?;
    for &v in vector {
        write_u32(writer, to_u32(v, "Index")?)?;
    }
    Ok(())
}

/// Read a vector written by `save_uint_vector`
pub fn load_uint_vector<R: Read>(reader: &mut R) -> Result<Vec<usize>> {
    let n = read_u32(reader)? as usize;
    let mut vector = Vec::with_capacity(n.min(MAX_PREALLOC));
    for _ in 0..n {
        vector.push(read_u32(reader)? as usize);
    }
    Ok(vector)
}

/// Write an optional index vector, `None` is stored as -1
pub fn save_int_vector<W: Write>(vector: &[Option<usize>], writer: &mut W) -> Result<()> {
    write_u32(writer, to_u32(vector.len(), "Vector length")?)?;
    for v in vector {
        let v = match v {
            Some(idx) => i32::try_from(*idx).map_err(|_| {
                HsneError::InvalidArgument(format!("Index {} does not fit the file format", idx))
            })?,
            None => NOT_A_LANDMARK,
        };
        writer.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

/// Read a vector written by `save_int_vector`
pub fn load_int_vector<R: Read>(reader: &mut R) -> Result<Vec<Option<usize>>> {
    let n = read_u32(reader)? as usize;
    let mut vector = Vec::with_capacity(n.min(MAX_PREALLOC));
    for _ in 0..n {
        let v = match read_i32(reader)? {
            NOT_A_LANDMARK => None,
            v if v >= 0 => Some(v as usize),
            v => return Err(HsneError::Runtime(format!("Invalid landmark index {}", v))),
        };
        vector.push(v);
    }
    Ok(vector)
}

/// Write a vector of scalars as f64
pub fn save_scalar_vector<T, W>(vector: &[T], writer: &mut W) -> Result<()>
where
    T: ToPrimitive + Copy,
    W: Write,
{
    write_u32(writer, to_u32(vector.len(), "Vector length")?)?;
    for &v in vector {
        write_f64(writer, to_f64(v))?;
    }
    Ok(())
}

/// Read a vector written by `save_scalar_vector`
pub fn load_scalar_vector<T, R>(reader: &mut R) -> Result<Vec<T>>
where
    T: Float + FromPrimitive,
    R: Read,
{
    let n = read_u32(reader)? as usize;
    let mut vector = Vec::with_capacity(n.min(MAX_PREALLOC));
    for _ in 0..n {
        vector.push(from_f64(read_f64(reader)?));
    }
    Ok(vector)
}

/// Write a sparse matrix
pub fn save_sparse_matrix<T, W>(matrix: &[SparseRow<T>], writer: &mut W) -> Result<()>
where
    T: Float,
    W: Write,
{
    write_u32(writer, to_u32(matrix.len(), "Number of rows")?)?;
    for row in matrix {
        write_u32(writer, to_u32(row.len(), "Row length")?)?;
        for (idx, v) in row.iter() {
            write_u32(writer, to_u32(idx, "Index")?)?;
            write_f64(writer, to_f64(v))?;
        }
    }
    Ok(())
}

/// Read a sparse matrix written by `save_sparse_matrix`
pub fn load_sparse_matrix<T, R>(reader: &mut R) -> Result<SparseMatrix<T>>
where
    T: Float + FromPrimitive,
    R: Read,
{
    let n_rows = read_u32(reader)? as usize;
    let mut matrix = Vec::with_capacity(n_rows.min(MAX_PREALLOC));
    for _ in 0..n_rows {
        let nnz = read_u32(reader)? as usize;
        let mut pairs = Vec::with_capacity(nnz.min(MAX_PREALLOC));
        for _ in 0..nnz {
            let idx = read_u32(reader)? as usize;
            pairs.push((idx, from_f64(read_f64(reader)?)));
        }
        matrix.push(SparseRow::from_pairs(pairs));
    }
    Ok(matrix)
}

//////////
// HSNE //
//////////

/// Write a hierarchy
///
/// ### Params
///
/// * `hsne` - The hierarchy
/// * `writer` - Destination
///
/// ### Returns
///
/// `HsneError::Logic` if the hierarchy is empty
pub fn save_hsne<T, W>(hsne: &HierarchicalSne<T>, writer: &mut W) -> Result<()>
where
    T: Float + FromPrimitive + ToPrimitive + Send + Sync + AddAssign,
    W: Write,
{
    let hierarchy = hsne.hierarchy();
    if hierarchy.is_empty() {
        return Err(HsneError::Logic(
            "Cannot save an empty HSNE hierarchy".to_string(),
        ));
    }
    log::debug!("Saving HSNE hierarchy with {} scales", hierarchy.len());

    write_u32(writer, MAJOR_VERSION)?;
    write_u32(writer, MINOR_VERSION)?;
    write_u32(writer, to_u32(hierarchy.len(), "Number of scales")?)?;

    let first = &hierarchy[0];
    write_u32(writer, to_u32(first.size(), "Scale size")?)?;
    save_sparse_matrix(&first.transition_matrix, writer)?;

    for (s, scale) in hierarchy.iter().enumerate().skip(1) {
        log::debug!("Saving scale {} ({} landmarks)", s, scale.size());
        write_u32(writer, to_u32(scale.size(), "Scale size")?)?;
        save_sparse_matrix(&scale.transition_matrix, writer)?;
        save_uint_vector(&scale.landmark_to_original_data_idx, writer)?;
        save_uint_vector(&scale.landmark_to_previous_scale_idx, writer)?;
        save_scalar_vector(&scale.landmark_weight, writer)?;
        save_int_vector(&scale.previous_scale_to_landmark_idx, writer)?;
        save_sparse_matrix(&scale.area_of_influence, writer)?;
    }

    writer.flush()?;
    Ok(())
}

fn check_len(len: usize, expected: usize, what: &str, scale_id: usize) -> Result<()> {
    if len != expected {
        return Err(HsneError::Runtime(format!(
            "Scale {}: {} has {} entries, expected {}",
            scale_id, what, len, expected
        )));
    }
    Ok(())
}

fn check_columns<T: Float>(
    matrix: &[SparseRow<T>],
    n_cols: usize,
    what: &str,
    scale_id: usize,
) -> Result<()> {
    for (row, entries) in matrix.iter().enumerate() {
        if let Some((idx, _)) = entries.iter().find(|&(idx, _)| idx >= n_cols) {
            return Err(HsneError::Runtime(format!(
                "Scale {}: {} row {} points to column {}, only {} columns",
                scale_id, what, row, idx, n_cols
            )));
        }
    }
    Ok(())
}

fn check_bound(values: &[usize], bound: usize, what: &str, scale_id: usize) -> Result<()> {
    if let Some(&bad) = values.iter().find(|&&v| v >= bound) {
        return Err(HsneError::Runtime(format!(
            "Scale {}: {} holds index {}, bound is {}",
            scale_id, what, bad, bound
        )));
    }
    Ok(())
}

/// Index maps of a coarse scale must point inside the scales they refer to
/// and agree with each other
fn check_scale<T: Float>(
    scale: &Scale<T>,
    n: usize,
    previous: &Scale<T>,
    n0: usize,
    scale_id: usize,
) -> Result<()> {
    let previous_size = previous.size();
    check_len(scale.transition_matrix.len(), n, "transition matrix", scale_id)?;
    check_len(scale.landmark_to_original_data_idx.len(), n, "landmark → data", scale_id)?;
    check_len(scale.landmark_to_previous_scale_idx.len(), n, "landmark → previous", scale_id)?;
    check_len(scale.landmark_weight.len(), n, "landmark weights", scale_id)?;
    check_len(
        scale.previous_scale_to_landmark_idx.len(),
        previous_size,
        "previous → landmark",
        scale_id,
    )?;
    check_len(scale.area_of_influence.len(), previous_size, "area of influence", scale_id)?;

    check_columns(&scale.transition_matrix, n, "transition matrix", scale_id)?;
    check_columns(&scale.area_of_influence, n, "area of influence", scale_id)?;
    check_bound(&scale.landmark_to_original_data_idx, n0, "landmark → data", scale_id)?;
    check_bound(
        &scale.landmark_to_previous_scale_idx,
        previous_size,
        "landmark → previous",
        scale_id,
    )?;

    for (l, &p) in scale.landmark_to_previous_scale_idx.iter().enumerate() {
        if scale.previous_scale_to_landmark_idx[p] != Some(l) {
            return Err(HsneError::Runtime(format!(
                "Scale {}: landmark {} maps to previous point {} which does not map back",
                scale_id, l, p
            )));
        }
    }
    for (p, &l) in scale.previous_scale_to_landmark_idx.iter().enumerate() {
        if let Some(l) = l {
            if l >= n || scale.landmark_to_previous_scale_idx[l] != p {
                return Err(HsneError::Runtime(format!(
                    "Scale {}: previous point {} maps to landmark {} which does not map back",
                    scale_id, p, l
                )));
            }
        }
    }
    Ok(())
}

/// Read a hierarchy written by `save_hsne`
///
/// Scale 0 gets identity index maps and unit weights. The high-dimensional
/// data is not part of the file.
///
/// ### Params
///
/// * `reader` - Source
///
/// ### Returns
///
/// The hierarchy or `HsneError::Runtime` for a bad version, an empty
/// hierarchy, inconsistent sizes, out of range indices or a truncated
/// stream
pub fn load_hsne<T, R>(reader: &mut R) -> Result<HierarchicalSne<T>>
where
    T: Float + FromPrimitive + ToPrimitive + Send + Sync + AddAssign,
    R: Read,
{
    let major = read_u32(reader)?;
    let minor = read_u32(reader)?;
    if major != MAJOR_VERSION || minor != MINOR_VERSION {
        return Err(HsneError::Runtime(format!(
            "Unsupported HSNE file version {}.{}",
            major, minor
        )));
    }

    let num_scales = read_u32(reader)? as usize;
    if num_scales == 0 {
        return Err(HsneError::Runtime(
            "Cannot load an empty hierarchy".to_string(),
        ));
    }
    log::debug!("Loading HSNE hierarchy with {} scales", num_scales);

    let mut hierarchy: Vec<Scale<T>> = Vec::with_capacity(num_scales.min(MAX_PREALLOC));

    let n0 = read_u32(reader)? as usize;
    let transition_matrix = load_sparse_matrix(reader)?;
    check_len(transition_matrix.len(), n0, "transition matrix", 0)?;
    check_columns(&transition_matrix, n0, "transition matrix", 0)?;
    hierarchy.push(Scale::identity(transition_matrix));

    for s in 1..num_scales {
        let n = read_u32(reader)? as usize;

        let scale = Scale {
            transition_matrix: load_sparse_matrix(reader)?,
            landmark_to_original_data_idx: load_uint_vector(reader)?,
            landmark_to_previous_scale_idx: load_uint_vector(reader)?,
            landmark_weight: load_scalar_vector(reader)?,
            previous_scale_to_landmark_idx: load_int_vector(reader)?,
            area_of_influence: load_sparse_matrix(reader)?,
        };

        check_scale(&scale, n, &hierarchy[s - 1], n0, s)?;

        log::debug!("Loaded scale {} ({} landmarks)", s, n);
        hierarchy.push(scale);
    }

    Ok(HierarchicalSne::from_hierarchy(hierarchy, HsneParams::default()))
}

#[cfg(test)]
mod test_io {
    use super::*;
    use std::io::Cursor;

    fn toy() -> HierarchicalSne<f32> {
        let scale0 = Scale::identity(vec![
            SparseRow::from_pairs(vec![(1, 0.5_f32), (2, 0.5)]),
            SparseRow::from_pairs(vec![(0, 1.0)]),
            SparseRow::from_pairs(vec![(0, 0.25), (1, 0.75)]),
        ]);
        let scale1 = Scale {
            landmark_to_original_data_idx: vec![0, 2],
            landmark_to_previous_scale_idx: vec![0, 2],
            transition_matrix: vec![
                SparseRow::from_pairs(vec![(1, 1.0)]),
                SparseRow::from_pairs(vec![(0, 1.0)]),
            ],
            landmark_weight: vec![1.7, 1.3],
            previous_scale_to_landmark_idx: vec![Some(0), None, Some(1)],
            area_of_influence: vec![
                SparseRow::from_pairs(vec![(0, 1.0)]),
                SparseRow::from_pairs(vec![(0, 0.7), (1, 0.3)]),
                SparseRow::from_pairs(vec![(1, 1.0)]),
            ],
        };
        HierarchicalSne::from_hierarchy(vec![scale0, scale1], HsneParams::default())
    }

    #[test]
    fn test_round_trip() {
        let hsne = toy();
        let mut buf = Vec::new();
        save_hsne(&hsne, &mut buf).unwrap();

        let loaded: HierarchicalSne<f32> = load_hsne(&mut Cursor::new(&buf)).unwrap();
        assert!(loaded.is_initialized());
        assert_eq!(loaded.hierarchy(), hsne.hierarchy());
    }

    #[test]
    fn test_header() {
        let mut buf = Vec::new();
        save_hsne(&toy(), &mut buf).unwrap();
        assert_eq!(&buf[0..12], &[0, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn test_errors() {
        let empty = HierarchicalSne::<f64>::new();
        assert!(matches!(
            save_hsne(&empty, &mut Vec::new()),
            Err(HsneError::Logic(_))
        ));

        let mut buf = Vec::new();
        save_hsne(&toy(), &mut buf).unwrap();

        let truncated = &buf[..buf.len() - 3];
        let res: Result<HierarchicalSne<f32>> = load_hsne(&mut Cursor::new(truncated));
        assert!(matches!(res, Err(HsneError::Runtime(_))));

        let mut bad_version = buf.clone();
        bad_version[0] = 1;
        let res: Result<HierarchicalSne<f32>> = load_hsne(&mut Cursor::new(&bad_version));
        assert!(matches!(res, Err(HsneError::Runtime(_))));

        let no_scales = [0_u8; 12];
        let res: Result<HierarchicalSne<f32>> = load_hsne(&mut Cursor::new(&no_scales[..]));
        assert!(matches!(res, Err(HsneError::Runtime(_))));
    }

    fn load_f32(buf: &[u8]) -> Result<HierarchicalSne<f32>> {
        load_hsne(&mut Cursor::new(buf))
    }

    fn corrupted(edit: impl FnOnce(&mut Scale<f32>)) -> Vec<u8> {
        let mut hierarchy = toy().hierarchy().to_vec();
        edit(&mut hierarchy[1]);
        let hsne = HierarchicalSne::from_hierarchy(hierarchy, HsneParams::default());
        let mut buf = Vec::new();
        save_hsne(&hsne, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_huge_counts_fail_cleanly() {
        let mut buf = Vec::new();
        for v in [0, 0, u32::MAX, 10, u32::MAX] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        assert!(matches!(load_f32(&buf), Err(HsneError::Runtime(_))));

        // a huge row length in an otherwise valid header
        let mut buf = Vec::new();
        for v in [0, 0, 1, 1, 1, u32::MAX] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        assert!(matches!(load_f32(&buf), Err(HsneError::Runtime(_))));

        let mut vector = Vec::new();
        vector.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            load_uint_vector(&mut Cursor::new(&vector)),
            Err(HsneError::Runtime(_))
        ));
        assert!(matches!(
            load_scalar_vector::<f64, _>(&mut Cursor::new(&vector)),
            Err(HsneError::Runtime(_))
        ));
    }

    #[test]
    fn test_out_of_range_indices() {
        let cases: Vec<(&str, Vec<u8>)> = vec![
            (
                "transition column",
                corrupted(|s| s.transition_matrix[0] = SparseRow::from_pairs(vec![(5, 1.0)])),
            ),
            (
                "area of influence column",
                corrupted(|s| s.area_of_influence[1] = SparseRow::from_pairs(vec![(7, 1.0)])),
            ),
            (
                "landmark to previous",
                corrupted(|s| s.landmark_to_previous_scale_idx = vec![0, 99]),
            ),
            (
                "landmark to data",
                corrupted(|s| s.landmark_to_original_data_idx = vec![0, 3]),
            ),
            (
                "previous to landmark",
                corrupted(|s| s.previous_scale_to_landmark_idx = vec![Some(0), None, Some(4)]),
            ),
            (
                "maps disagree",
                corrupted(|s| s.previous_scale_to_landmark_idx = vec![Some(0), Some(1), None]),
            ),
        ];
        for (what, buf) in cases {
            assert!(
                matches!(load_f32(&buf), Err(HsneError::Runtime(_))),
                "Corrupt {} must be rejected",
                what
            );
        }

        // scale 0 transition matrix
        let mut hierarchy = toy().hierarchy().to_vec();
        hierarchy[0].transition_matrix[1] = SparseRow::from_pairs(vec![(3, 1.0)]);
        let hsne = HierarchicalSne::from_hierarchy(hierarchy, HsneParams::default());
        let mut buf = Vec::new();
        save_hsne(&hsne, &mut buf).unwrap();
        assert!(matches!(load_f32(&buf), Err(HsneError::Runtime(_))));
    }

    #[test]
    fn test_length_mismatch() {
        let buf = corrupted(|s| s.landmark_weight.push(0.5));
        assert!(matches!(load_f32(&buf), Err(HsneError::Runtime(_))));

        let buf = corrupted(|s| {
            s.area_of_influence.pop();
        });
        assert!(matches!(load_f32(&buf), Err(HsneError::Runtime(_))));
    }

    #[test]
    fn test_int_vector() {
        let mut buf = Vec::new();
        save_int_vector(&[Some(3), None, Some(0)], &mut buf).unwrap();
        let back = load_int_vector(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(back, vec![Some(3), None, Some(0)]);
    }
}
