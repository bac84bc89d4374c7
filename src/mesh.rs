//! Triangle meshes decoded from latents.
//!
//! [`TriMesh`] is the hand-off between the decoder and the asset writer. It
//! carries the decoder post-condition ([`TriMesh::validate`]) and the two
//! exchange serializations:
//!
//! - OBJ: `v x y z [r g b]` lines, then 1-based `f i j k` lines
//! - STL: binary (80-byte header, u32 count, 50 bytes per facet) or ASCII

use std::io::{self, Write};

use glam::Vec3;

/// Indexed triangle mesh with optional per-vertex RGB colors in [0, 1].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TriMesh {
    pub vertices: Vec<[f32; 3]>,
    pub faces: Vec<[u32; 3]>,
    pub vertex_colors: Option<Vec<[f32; 3]>>,
}

/// Why a mesh failed [`TriMesh::validate`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MeshError {
    #[error("mesh has {0} vertices, need at least 3")]
    TooFewVertices(usize),

    #[error("mesh has no faces")]
    NoFaces,

    #[error("face {face} references vertex {index}, but the mesh has {vertex_count} vertices")]
    IndexOutOfBounds {
        face: usize,
        index: u32,
        vertex_count: usize,
    },

    #[error("vertex {0} has a non-finite coordinate")]
    NonFiniteVertex(usize),

    #[error("{colors} vertex colors for {vertices} vertices")]
    ColorCountMismatch { colors: usize, vertices: usize },
}

impl TriMesh {
    pub fn new(vertices: Vec<[f32; 3]>, faces: Vec<[u32; 3]>) -> Self {
        Self {
            vertices,
            faces,
            vertex_colors: None,
        }
    }

    pub fn with_vertex_colors(mut self, colors: Vec<[f32; 3]>) -> Self {
        self.vertex_colors = Some(colors);
        self
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn has_vertex_colors(&self) -> bool {
        self.vertex_colors.is_some()
    }

    /// Check the mesh is usable downstream: at least one triangle, every
    /// index in bounds, finite coordinates, one color per vertex if colored.
    pub fn validate(&self) -> Result<(), MeshError> {
        let vertex_count = self.vertices.len();
        if vertex_count < 3 {
            return Err(MeshError::TooFewVertices(vertex_count));
        }
        if self.faces.is_empty() {
            return Err(MeshError::NoFaces);
        }
        if let Some(i) = self
            .vertices
            .iter()
            .position(|v| v.iter().any(|c| !c.is_finite()))
        {
            return Err(MeshError::NonFiniteVertex(i));
        }
        for (face, tri) in self.faces.iter().enumerate() {
            if let Some(&index) = tri.iter().find(|&&i| i as usize >= vertex_count) {
                return Err(MeshError::IndexOutOfBounds {
                    face,
                    index,
                    vertex_count,
                });
            }
        }
        if let Some(colors) = &self.vertex_colors
            && colors.len() != vertex_count
        {
            return Err(MeshError::ColorCountMismatch {
                colors: colors.len(),
                vertices: vertex_count,
            });
        }
        Ok(())
    }

    /// Unit facet normal (right-hand winding). Degenerate triangles get zero.
    pub fn face_normal(&self, face: usize) -> [f32; 3] {
        let [a, b, c] = self.triangle(face);
        (b - a).cross(c - a).normalize_or_zero().to_array()
    }

    fn triangle(&self, face: usize) -> [Vec3; 3] {
        let [i, j, k] = self.faces[face];
        [
            Vec3::from_array(self.vertices[i as usize]),
            Vec3::from_array(self.vertices[j as usize]),
            Vec3::from_array(self.vertices[k as usize]),
        ]
    }

    /// Axis-aligned bounds `(min, max)`, or `None` for an empty mesh.
    pub fn bounds(&self) -> Option<([f32; 3], [f32; 3])> {
        let first = Vec3::from_array(*self.vertices.first()?);
        let (min, max) = self.vertices.iter().fold((first, first), |(min, max), v| {
            let v = Vec3::from_array(*v);
            (min.min(v), max.max(v))
        });
        Some((min.to_array(), max.to_array()))
    }

    /// Serialize as Wavefront OBJ.
    ///
    /// Vertex colors, when present, are appended to the `v` line as the
    /// widely supported `v x y z r g b` extension.
    pub fn write_obj<W: Write>(&self, mut writer: W) -> io::Result<()> {
        match &self.vertex_colors {
            Some(colors) => {
                for (v, c) in self.vertices.iter().zip(colors) {
                    writeln!(writer, "v {} {} {} {} {} {}", v[0], v[1], v[2], c[0], c[1], c[2])?;
                }
            }
            None => {
                for v in &self.vertices {
                    writeln!(writer, "v {} {} {}", v[0], v[1], v[2])?;
                }
            }
        }
        for f in &self.faces {
            writeln!(writer, "f {} {} {}", f[0] + 1, f[1] + 1, f[2] + 1)?;
        }
        writer.flush()
    }

    /// Serialize as binary STL (triangle soup, colors dropped).
    pub fn write_stl<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let mut header = [0u8; 80];
        let label = b"text3d-rs binary STL";
        header[..label.len()].copy_from_slice(label);
        writer.write_all(&header)?;

        let count = u32::try_from(self.faces.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many faces for STL"))?;
        writer.write_all(&count.to_le_bytes())?;

        for face in 0..self.faces.len() {
            let normal = self.face_normal(face);
            for value in normal {
                writer.write_all(&value.to_le_bytes())?;
            }
            for vertex in self.triangle(face) {
                for value in vertex.to_array() {
                    writer.write_all(&value.to_le_bytes())?;
                }
            }
            // Attribute byte count, unused.
            writer.write_all(&0u16.to_le_bytes())?;
        }
        writer.flush()
    }

    /// Serialize as ASCII STL.
    pub fn write_stl_ascii<W: Write>(&self, mut writer: W, name: &str) -> io::Result<()> {
        writeln!(writer, "solid {name}")?;
        for face in 0..self.faces.len() {
            let n = self.face_normal(face);
            writeln!(writer, "  facet normal {} {} {}", n[0], n[1], n[2])?;
            writeln!(writer, "    outer loop")?;
            for v in self.triangle(face) {
                writeln!(writer, "      vertex {} {} {}", v.x, v.y, v.z)?;
            }
            writeln!(writer, "    endloop")?;
            writeln!(writer, "  endfacet")?;
        }
        writeln!(writer, "endsolid {name}")?;
        writer.flush()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A unit right tetrahedron.
    pub(crate) fn tetrahedron() -> TriMesh {
        TriMesh::new(
            vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
            ],
            vec![[0, 2, 1], [0, 1, 3], [0, 3, 2], [1, 2, 3]],
        )
    }

    /// Minimal OBJ reader: returns (vertex count, faces as 0-based indices).
    pub(crate) fn parse_obj(text: &str) -> (usize, Vec<[usize; 3]>) {
        let mut vertices = 0;
        let mut faces = Vec::new();
        for line in text.lines() {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("v") => {
                    let coords: Vec<f32> = parts.map(|p| p.parse().unwrap()).collect();
                    assert!(coords.len() == 3 || coords.len() == 6, "bad vertex line: {line}");
                    vertices += 1;
                }
                Some("f") => {
                    let idx: Vec<usize> = parts.map(|p| p.parse().unwrap()).collect();
                    assert_eq!(idx.len(), 3, "bad face line: {line}");
                    assert!(idx.iter().all(|&i| i >= 1), "OBJ indices are 1-based: {line}");
                    faces.push([idx[0] - 1, idx[1] - 1, idx[2] - 1]);
                }
                _ => panic!("unexpected OBJ line: {line}"),
            }
        }
        (vertices, faces)
    }

    #[test]
    fn test_validate_accepts_tetrahedron() {
        assert_eq!(tetrahedron().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_degenerate_meshes() {
        let empty = TriMesh::default();
        assert_eq!(empty.validate(), Err(MeshError::TooFewVertices(0)));

        let no_faces = TriMesh::new(tetrahedron().vertices, vec![]);
        assert_eq!(no_faces.validate(), Err(MeshError::NoFaces));

        let mut out_of_bounds = tetrahedron();
        out_of_bounds.faces.push([0, 1, 4]);
        assert_eq!(
            out_of_bounds.validate(),
            Err(MeshError::IndexOutOfBounds {
                face: 4,
                index: 4,
                vertex_count: 4
            })
        );

        let mut nan = tetrahedron();
        nan.vertices[2][1] = f32::NAN;
        assert_eq!(nan.validate(), Err(MeshError::NonFiniteVertex(2)));

        let colors = tetrahedron().with_vertex_colors(vec![[1.0, 0.0, 0.0]]);
        assert_eq!(
            colors.validate(),
            Err(MeshError::ColorCountMismatch {
                colors: 1,
                vertices: 4
            })
        );
    }

    #[test]
    fn test_obj_layout() {
        let mut buf = Vec::new();
        tetrahedron().write_obj(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "v 0 0 0");
        assert_eq!(lines[1], "v 1 0 0");
        assert_eq!(lines[4], "f 1 3 2");

        // Vertices precede faces.
        let first_face = lines.iter().position(|l| l.starts_with("f ")).unwrap();
        assert!(lines[..first_face].iter().all(|l| l.starts_with("v ")));

        let (vertices, faces) = parse_obj(&text);
        assert_eq!(vertices, 4);
        assert_eq!(faces.len(), 4);
        assert!(faces.iter().flatten().all(|&i| i < vertices));
    }

    #[test]
    fn test_obj_with_colors() {
        let colors = vec![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.5, 0.5, 0.5]];
        let mesh = tetrahedron().with_vertex_colors(colors);
        let mut buf = Vec::new();
        mesh.write_obj(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("v 0 0 0 1 0 0\n"), "{text}");
        assert!(text.contains("v 0 0 1 0.5 0.5 0.5\n"), "{text}");
    }

    #[test]
    fn test_binary_stl_size_and_count() {
        let mesh = tetrahedron();
        let mut buf = Vec::new();
        mesh.write_stl(&mut buf).unwrap();
        assert_eq!(buf.len(), 84 + 50 * mesh.face_count());
        assert!(buf.starts_with(b"text3d-rs binary STL"));
        let count = u32::from_le_bytes([buf[80], buf[81], buf[82], buf[83]]);
        assert_eq!(count, 4);
    }

    #[test]
    fn test_binary_stl_first_facet_normal() {
        let mut buf = Vec::new();
        tetrahedron().write_stl(&mut buf).unwrap();
        // Face [0, 2, 1] lies in z = 0 and winds toward -z.
        let nz = f32::from_le_bytes([buf[92], buf[93], buf[94], buf[95]]);
        assert!((nz + 1.0).abs() < 1e-6, "nz = {nz}");
    }

    #[test]
    fn test_ascii_stl_layout() {
        let mut buf = Vec::new();
        tetrahedron().write_stl_ascii(&mut buf, "tetra").unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("solid tetra\n"));
        assert!(text.trim_end().ends_with("endsolid tetra"));
        assert_eq!(text.matches("facet normal").count(), 4);
        assert_eq!(text.matches("vertex ").count(), 12);
    }

    #[test]
    fn test_bounds() {
        let (min, max) = tetrahedron().bounds().unwrap();
        assert_eq!(min, [0.0, 0.0, 0.0]);
        assert_eq!(max, [1.0, 1.0, 1.0]);
        assert!(TriMesh::default().bounds().is_none());
    }
}
