use quote::ToTokens;
use syn::{Attribute, Field, FieldsNamed, Token, Type, punctuated::Punctuated};

// 提取非 derive 属性与已有 derive 列表
fn split_derives(attrs: &[Attribute]) -> (Vec<Attribute>, Vec<syn::Path>) {
    let mut retained = Vec::new();
    let mut existing = Vec::new();
    for attr in attrs.iter() {
        if attr.path().is_ident("derive") {
            if let Ok(list) =
                attr.parse_args_with(Punctuated::<syn::Path, Token![,]>::parse_terminated)
            {
                existing.extend(list);
            }
        } else {
            retained.push(attr.clone());
        }
    }
    (retained, existing)
}

// 归一化 derive 的 key，避免 Serialize 与 serde::Serialize 重复
fn derive_key(p: &syn::Path) -> String {
    match p.segments.last() {
        Some(last) => {
            let name = last.ident.to_string();
            match name.as_str() {
                "Serialize" | "Deserialize" => format!("serde::{name}"),
                _ => name,
            }
        }
        None => p.to_token_stream().to_string(),
    }
}

/// 合并必需派生与已有派生（去重，必需派生在前），其余属性保持原顺序
pub(crate) fn apply_derives(attrs: &mut Vec<Attribute>, required: Vec<syn::Path>) {
    let (retained, existing) = split_derives(attrs);

    let mut seen = std::collections::HashSet::<String>::new();
    let merged: Vec<syn::Path> = required
        .into_iter()
        .chain(existing)
        .filter(|p| seen.insert(derive_key(p)))
        .collect();

    let derive: Attribute = syn::parse_quote!(#[derive(#(#merged),*)]);
    *attrs = std::iter::once(derive).chain(retained).collect();
}

/// 确保具名字段结构体包含所需字段
/// - `reposition_existing` 为 true：所需字段一律移到最前（已存在则复用原定义）；
/// - 为 false：仅在缺失时追加到最前，既有字段顺序不变。
pub(crate) fn ensure_required_fields(
    fields_named: &mut FieldsNamed,
    required: &[(&str, &Type)],
    reposition_existing: bool,
) -> syn::Result<()> {
    let old_named = fields_named.named.clone();
    let mut new_named: Punctuated<Field, Token![,]> = Punctuated::new();

    for (name, ty) in required {
        let existing = old_named
            .iter()
            .find(|f| f.ident.as_ref().is_some_and(|i| i == name));
        match existing {
            Some(field) if reposition_existing => new_named.push(field.clone()),
            Some(_) => {}
            None => {
                let ident: syn::Ident = syn::parse_str(name)?;
                new_named.push(syn::parse_quote! { #ident: #ty });
            }
        }
    }

    for f in old_named {
        let is_required = f
            .ident
            .as_ref()
            .is_some_and(|i| required.iter().any(|(n, _)| i == n));
        if !(reposition_existing && is_required) {
            new_named.push(f);
        }
    }

    fields_named.named = new_named;
    Ok(())
}
