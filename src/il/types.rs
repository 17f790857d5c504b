//! Structural IL types.

use crate::context::{Context, Type};
use smallvec::SmallVec;

/// Definition for a [`Type`], interned in [`Context`].
///
/// Two structurally identical definitions always intern to the same `Type`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeDef {
    /// A type the IL has no model for, `tag` keeps distinct ones distinct
    /// (e.g. the source type table index).
    Unexposed { tag: u32 },

    Void,
    Bool,
    Int { bit_width: u8, signed: bool },
    Fp { bit_width: u8 },

    Vector { contained: Type, dim: u8 },
    Matrix { contained: Type, rows: u8, columns: u8 },
    Pointer { pointee: Type, address_space: AddressSpace },
    Array { element: Type, count: u64 },
    Struct { members: SmallVec<[Type; 4]> },

    Function {
        return_type: Type,
        params: SmallVec<[Type; 4]>,
        variadic: bool,
    },

    Buffer {
        element: Option<Type>,
        sampler_mode: ResourceSamplerMode,
        texel: Format,
    },
    Texture {
        dimension: TextureDimension,
        sampled: Option<Type>,
        multisampled: bool,
        sampler_mode: ResourceSamplerMode,
        format: Format,
    },
    Sampler,

    Label,
    Metadata,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    Function,
    Device,
    Constant,
    GroupShared,
    Unexposed(u32),
}

impl AddressSpace {
    pub fn from_dxil(space: u64) -> Self {
        match space {
            0 => AddressSpace::Function,
            1 => AddressSpace::Device,
            2 => AddressSpace::Constant,
            3 => AddressSpace::GroupShared,
            other => AddressSpace::Unexposed(other as u32),
        }
    }

    pub fn to_dxil(self) -> u64 {
        match self {
            AddressSpace::Function => 0,
            AddressSpace::Device => 1,
            AddressSpace::Constant => 2,
            AddressSpace::GroupShared => 3,
            AddressSpace::Unexposed(space) => space.into(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceSamplerMode {
    RuntimeOnly,
    Compatible,
    Writable,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    Texture1D,
    Texture2D,
    Texture3D,
    Texture1DArray,
    Texture2DArray,
    Texture2DCube,
    Texture2DCubeArray,
    Unexposed,
}

/// Texel formats.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    None,
    RGBA32Float,
    RGBA16Float,
    R32Float,
    R32Snorm,
    R32Unorm,
    RGBA8,
    RGBA8Snorm,
    RG32Float,
    RG16Float,
    R11G11B10Float,
    R16Float,
    RGBA16,
    RGB10A2,
    RG16,
    RG8,
    R16,
    R8,
    RGBA16Snorm,
    RG16Snorm,
    RG8Snorm,
    R16Snorm,
    R16Unorm,
    R8Snorm,
    RGBA32Int,
    RGBA16Int,
    RGBA8Int,
    R32Int,
    RG32Int,
    RG16Int,
    RG8Int,
    R16Int,
    R8Int,
    RGBA32UInt,
    RGBA16UInt,
    RGBA8UInt,
    R32UInt,
    RGB10A2UInt,
    RG32UInt,
    RG16UInt,
    RG8UInt,
    R16UInt,
    R8UInt,
    Unexposed,
}

impl Format {
    /// Size of one texel, in bytes (`0` if unknown).
    pub fn size(self) -> u8 {
        use Format::*;
        match self {
            RGBA32Float | RGBA32Int | RGBA32UInt => 16,
            RGBA16Float | RGBA16 | RGBA16Snorm | RGBA16Int | RGBA16UInt | RG32Float
            | RG32Int | RG32UInt => 8,
            R32Float | R32Snorm | R32Unorm | RGBA8 | RGBA8Snorm | R11G11B10Float | RGB10A2
            | RG16 | RG16Snorm | RGBA8Int | R32Int | RG16Int | RGBA8UInt | R32UInt
            | RGB10A2UInt | RG16UInt | RG16Float => 4,
            R16Float | RG8 | R16 | RG8Snorm | R16Snorm | R16Unorm | RG8Int | R16Int | RG8UInt
            | R16UInt => 2,
            R8 | R8Snorm | R8Int | R8UInt => 1,
            None | Unexposed => 0,
        }
    }
}

impl TypeDef {
    pub fn is_void(&self) -> bool {
        matches!(self, TypeDef::Void)
    }

    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            TypeDef::Buffer { .. } | TypeDef::Texture { .. } | TypeDef::Sampler
        )
    }
}

/// Scalar component type of `ty` (`ty` itself if not a vector).
pub fn component_type(cx: &Context, ty: Type) -> Type {
    match cx[ty] {
        TypeDef::Vector { contained, .. } => contained,
        _ => ty,
    }
}

/// Number of components of `ty` (`1` if not a vector).
pub fn component_count(cx: &Context, ty: Type) -> u32 {
    match cx[ty] {
        TypeDef::Vector { dim, .. } => dim.into(),
        _ => 1,
    }
}

/// Replace the component type of `ty` with `component`, keeping its shape,
/// e.g. `splat(<4 x i32>, bool) = <4 x bool>`.
pub fn splat(cx: &Context, ty: Type, component: Type) -> Type {
    match cx[ty] {
        TypeDef::Vector { dim, .. } => cx.intern(TypeDef::Vector {
            contained: component,
            dim,
        }),
        _ => component,
    }
}

/// Whether `ty` is a signed integer type (or a vector of them).
pub fn is_signed(cx: &Context, ty: Type) -> bool {
    matches!(cx[component_type(cx, ty)], TypeDef::Int { signed: true, .. })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splat_keeps_shape() {
        let cx = Context::new();
        let i32_ty = cx.intern(TypeDef::Int {
            bit_width: 32,
            signed: true,
        });
        let bool_ty = cx.intern(TypeDef::Bool);
        let vec4 = cx.intern(TypeDef::Vector {
            contained: i32_ty,
            dim: 4,
        });

        let bvec4 = splat(&cx, vec4, bool_ty);
        assert_eq!(component_type(&cx, bvec4), bool_ty);
        assert_eq!(component_count(&cx, bvec4), 4);
        assert_eq!(splat(&cx, i32_ty, bool_ty), bool_ty);
        assert!(is_signed(&cx, vec4));
        assert!(!is_signed(&cx, bvec4));
    }

    #[test]
    fn format_sizes() {
        assert_eq!(Format::R32UInt.size(), 4);
        assert_eq!(Format::RGBA32Float.size(), 16);
        assert_eq!(Format::Unexposed.size(), 0);
    }
}
