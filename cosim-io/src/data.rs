//! Mesh and field exchange model.
//!
//! Everything crossing a [`Transport`](crate::transport::Transport) is a [`Payload`]: either a flat
//! [`FieldData`] array or an interface [`MeshData`]. Payloads are created fresh for every exchange
//! and a received payload is owned by the receiver.

use std::{collections::BTreeMap, fmt};

use itertools::Itertools;

use crate::error::DataError;

/// What kind of payload an identifier stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Field,
    Mesh,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKind::Field => f.write_str("field data"),
            DataKind::Mesh => f.write_str("a mesh"),
        }
    }
}

/// An ordered sequence of values, either raw scalars or flattened 3-component vectors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldData {
    values: Vec<f64>,
}

impl FieldData {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn zeros(len: usize) -> Self {
        Self {
            values: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }

    /// Number of 3-vectors when the values are read as vector data (the last one may be partial).
    pub fn num_vectors(&self) -> usize {
        self.values.len().div_ceil(3)
    }

    /// Iterate the values as 3-component chunks.
    pub fn vectors(&self) -> impl Iterator<Item = &[f64]> + '_ {
        self.values.chunks(3)
    }
}

impl From<Vec<f64>> for FieldData {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}

impl From<&[f64]> for FieldData {
    fn from(values: &[f64]) -> Self {
        Self::new(values.to_vec())
    }
}

/// Interface element types, tagged with their VTK cell-type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElementType {
    Vertex = 1,
    Line = 3,
    Triangle = 5,
    Quadrilateral = 9,
    Tetrahedron = 10,
    Hexahedron = 12,
    Wedge = 13,
    Pyramid = 14,
}

impl ElementType {
    pub fn from_vtk(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Vertex),
            3 => Some(Self::Line),
            5 => Some(Self::Triangle),
            9 => Some(Self::Quadrilateral),
            10 => Some(Self::Tetrahedron),
            12 => Some(Self::Hexahedron),
            13 => Some(Self::Wedge),
            14 => Some(Self::Pyramid),
            _ => None,
        }
    }

    pub fn vtk_code(self) -> u8 {
        self as u8
    }

    /// Number of nodes an element of this type connects.
    pub fn num_nodes(self) -> usize {
        match self {
            Self::Vertex => 1,
            Self::Line => 2,
            Self::Triangle => 3,
            Self::Quadrilateral => 4,
            Self::Tetrahedron => 4,
            Self::Hexahedron => 8,
            Self::Wedge => 6,
            Self::Pyramid => 5,
        }
    }
}

/// Defect found while validating a [`MeshData`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshDefect {
    /// `connectivities` and `element_types` differ in length.
    TypeCountMismatch {
        connectivities: usize,
        element_types: usize,
    },
    /// An element does not reference as many nodes as its type requires.
    NodeCount {
        element: usize,
        element_type: ElementType,
        found: usize,
    },
    /// An element references a node past the end of the node array.
    DanglingNode {
        element: usize,
        node_index: usize,
        num_nodes: usize,
    },
}

impl MeshDefect {
    pub(crate) fn into_data_error(self, connection: &str, identifier: &str) -> DataError {
        let connection = connection.to_owned();
        let identifier = identifier.to_owned();
        match self {
            MeshDefect::TypeCountMismatch {
                connectivities,
                element_types,
            } => DataError::ElementTypeCountMismatch {
                connection,
                identifier,
                connectivities,
                element_types,
            },
            MeshDefect::NodeCount {
                element,
                element_type,
                found,
            } => DataError::ElementNodeCountMismatch {
                connection,
                identifier,
                element,
                element_type,
                expected: element_type.num_nodes(),
                found,
            },
            MeshDefect::DanglingNode {
                element,
                node_index,
                num_nodes,
            } => DataError::InvalidConnectivity {
                connection,
                identifier,
                element,
                node_index,
                num_nodes,
            },
        }
    }
}

/// An interface mesh: node coordinates, element connectivities and a parallel element-type list.
///
/// Connectivities hold offsets into `nodes`; they never own nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub nodes: Vec<[f64; 3]>,
    pub connectivities: Vec<Vec<usize>>,
    pub element_types: Vec<ElementType>,
}

impl MeshData {
    pub fn new(
        nodes: Vec<[f64; 3]>,
        connectivities: Vec<Vec<usize>>,
        element_types: Vec<ElementType>,
    ) -> Self {
        Self {
            nodes,
            connectivities,
            element_types,
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_elements(&self) -> usize {
        self.connectivities.len()
    }

    /// Iterate `(type, connectivity)` pairs.
    pub fn elements(&self) -> impl Iterator<Item = (ElementType, &[usize])> + '_ {
        self.element_types
            .iter()
            .copied()
            .zip(self.connectivities.iter().map(Vec::as_slice))
    }

    /// Check that every connectivity resolves to a node and matches its element type.
    pub fn validate(&self) -> Result<(), MeshDefect> {
        if self.connectivities.len() != self.element_types.len() {
            return Err(MeshDefect::TypeCountMismatch {
                connectivities: self.connectivities.len(),
                element_types: self.element_types.len(),
            });
        }

        for (element, (element_type, conn)) in self.elements().enumerate() {
            if conn.len() != element_type.num_nodes() {
                return Err(MeshDefect::NodeCount {
                    element,
                    element_type,
                    found: conn.len(),
                });
            }
            if let Some(&node_index) = conn.iter().find(|&&idx| idx >= self.nodes.len()) {
                return Err(MeshDefect::DanglingNode {
                    element,
                    node_index,
                    num_nodes: self.nodes.len(),
                });
            }
        }

        Ok(())
    }
}

/// A typed payload crossing the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Field(FieldData),
    Mesh(MeshData),
}

impl Payload {
    pub fn kind(&self) -> DataKind {
        match self {
            Payload::Field(_) => DataKind::Field,
            Payload::Mesh(_) => DataKind::Mesh,
        }
    }
}

/// A named field owned by one solver, the operand of a data transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceData {
    pub name: String,
    pub solver_name: String,
    /// Components per entity (1 for scalars, 3 for vectors).
    pub dimension: usize,
    data: FieldData,
}

impl InterfaceData {
    pub fn new(
        name: impl Into<String>,
        solver_name: impl Into<String>,
        dimension: usize,
        data: impl Into<FieldData>,
    ) -> Self {
        Self {
            name: name.into(),
            solver_name: solver_name.into(),
            dimension,
            data: data.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &FieldData {
        &self.data
    }

    /// Replace the stored values.
    pub fn set_data(&mut self, data: impl Into<FieldData>) {
        self.data = data.into();
    }
}

/// The identifiers a connection knows, with the payload kind each stands for.
#[derive(Debug, Clone, Default)]
pub struct DataDictionary {
    entries: BTreeMap<String, DataKind>,
}

impl DataDictionary {
    pub fn declare(&mut self, identifier: impl Into<String>, kind: DataKind) {
        self.entries.insert(identifier.into(), kind);
    }

    pub fn kind_of(&self, identifier: &str) -> Option<DataKind> {
        self.entries.get(identifier).copied()
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.keys().map(String::as_str)
    }

    /// Validate that `identifier` is known and stands for `kind`.
    pub fn check(
        &self,
        connection: &str,
        identifier: &str,
        kind: DataKind,
    ) -> Result<(), DataError> {
        match self.kind_of(identifier) {
            None => Err(DataError::UnknownIdentifier {
                connection: connection.to_owned(),
                identifier: identifier.to_owned(),
                known: self.identifiers().join(", "),
            }),
            Some(expected) if expected != kind => Err(DataError::PayloadKindMismatch {
                connection: connection.to_owned(),
                identifier: identifier.to_owned(),
                expected,
                found: kind,
            }),
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_mesh() -> MeshData {
        MeshData::new(
            vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [1.0, 1.0, 0.0],
                [0.0, 1.0, 0.0],
            ],
            vec![vec![0, 1, 2, 3], vec![0, 1, 2]],
            vec![ElementType::Quadrilateral, ElementType::Triangle],
        )
    }

    #[test]
    fn test_valid_mesh() {
        assert_eq!(quad_mesh().validate(), Ok(()));
    }

    #[test]
    fn test_dangling_node() {
        let mut mesh = quad_mesh();
        mesh.connectivities[1][2] = 7;
        assert_eq!(
            mesh.validate(),
            Err(MeshDefect::DanglingNode {
                element: 1,
                node_index: 7,
                num_nodes: 4
            })
        );
    }

    #[test]
    fn test_node_count_mismatch() {
        let mut mesh = quad_mesh();
        mesh.element_types[1] = ElementType::Line;
        assert_eq!(
            mesh.validate(),
            Err(MeshDefect::NodeCount {
                element: 1,
                element_type: ElementType::Line,
                found: 3
            })
        );
    }

    #[test]
    fn test_type_count_mismatch() {
        let mut mesh = quad_mesh();
        mesh.element_types.pop();
        assert!(matches!(
            mesh.validate(),
            Err(MeshDefect::TypeCountMismatch { .. })
        ));
    }

    #[test]
    fn test_vtk_codes() {
        for code in 0..=u8::MAX {
            if let Some(ty) = ElementType::from_vtk(code) {
                assert_eq!(ty.vtk_code(), code);
            }
        }
        assert_eq!(ElementType::from_vtk(2), None);
    }

    #[test]
    fn test_field_vectors() {
        let field = FieldData::new(vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(field.num_vectors(), 2);
        assert_eq!(field.vectors().last(), Some(&[4.0][..]));
    }

    #[test]
    fn test_dictionary_check() {
        let mut dict = DataDictionary::default();
        dict.declare("Interface_disp", DataKind::Field);
        dict.declare("Fluid.Interface", DataKind::Mesh);

        assert!(dict.check("c", "Interface_disp", DataKind::Field).is_ok());
        match dict.check("c", "Interface_force", DataKind::Field) {
            Err(DataError::UnknownIdentifier { known, .. }) => {
                assert_eq!(known, "Fluid.Interface, Interface_disp")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            dict.check("c", "Fluid.Interface", DataKind::Field),
            Err(DataError::PayloadKindMismatch { .. })
        ));
    }
}
