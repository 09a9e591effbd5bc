use crate::utils::{apply_derives, ensure_required_fields};
use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{Item, LitStr, Result, Token, Type, parse::Parse, parse::ParseStream, parse_macro_input};

pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as IntegrationEventAttrConfig);
    let input = parse_macro_input!(item as Item);

    let mut st = match input {
        Item::Struct(s) => s,
        other => {
            return syn::Error::new(other.span(), "#[integration_event] only on struct")
                .to_compile_error()
                .into();
        }
    };

    let fields_named = match &mut st.fields {
        syn::Fields::Named(f) => f,
        _ => {
            return syn::Error::new(st.span(), "only supports named-field struct")
                .to_compile_error()
                .into();
        }
    };

    let id_ty: Type = syn::parse_quote! { ::outbox_domain::uuid::Uuid };
    let entity_id_ty: Type =
        syn::parse_quote! { ::std::option::Option<::std::string::String> };
    let creation_date_ty: Type = syn::parse_quote! {
        ::outbox_domain::chrono::DateTime<::outbox_domain::chrono::Utc>
    };

    if let Err(err) = ensure_required_fields(
        fields_named,
        &[
            ("id", &id_ty),
            ("entity_id", &entity_id_ty),
            ("creation_date", &creation_date_ty),
        ],
        false,
    ) {
        return err.to_compile_error().into();
    }

    apply_derives(
        &mut st.attrs,
        vec![
            syn::parse_quote!(Debug),
            syn::parse_quote!(Clone),
            syn::parse_quote!(serde::Serialize),
            syn::parse_quote!(serde::Deserialize),
        ],
    );

    let ident = &st.ident;
    let (impl_generics, ty_generics, where_clause) = st.generics.split_for_impl();

    let type_name = match &cfg.type_name {
        Some(lit) => quote! { #lit },
        None => quote! { ::std::concat!(::std::module_path!(), "::", ::std::stringify!(#ident)) },
    };

    let expanded = quote! {
        #st

        impl #impl_generics ::outbox_domain::integration_event::IntegrationEvent
            for #ident #ty_generics #where_clause
        {
            const TYPE_NAME: &'static str = #type_name;

            fn id(&self) -> ::outbox_domain::uuid::Uuid {
                self.id
            }

            fn creation_date(&self) -> ::outbox_domain::chrono::DateTime<::outbox_domain::chrono::Utc> {
                self.creation_date
            }

            fn entity_id(&self) -> ::std::option::Option<&str> {
                self.entity_id.as_deref()
            }

            fn set_entity_id(&mut self, entity_id: ::std::string::String) {
                self.entity_id = ::std::option::Option::Some(entity_id);
            }
        }
    };

    TokenStream::from(expanded)
}

// 解析键值参数：type_name = "..."
struct IntegrationEventAttrConfig {
    type_name: Option<LitStr>,
}

struct KvLitStr {
    key: syn::Ident,
    value: LitStr,
}

impl Parse for KvLitStr {
    fn parse(input: ParseStream) -> Result<Self> {
        let key = input.parse()?;
        input.parse::<Token![=]>()?;
        let value = input.parse()?;
        Ok(Self { key, value })
    }
}

impl Parse for IntegrationEventAttrConfig {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut type_name: Option<LitStr> = None;

        let pairs = Punctuated::<KvLitStr, Token![,]>::parse_terminated(input)?;
        for kv in pairs {
            match kv.key.to_string().as_str() {
                "type_name" => {
                    if type_name.is_some() {
                        return Err(syn::Error::new(
                            kv.key.span(),
                            "duplicate key 'type_name' in attribute",
                        ));
                    }
                    if kv.value.value().trim().is_empty() {
                        return Err(syn::Error::new(
                            kv.value.span(),
                            "'type_name' must not be empty",
                        ));
                    }
                    type_name = Some(kv.value);
                }
                _ => {
                    return Err(syn::Error::new(
                        kv.key.span(),
                        "unknown key; expected 'type_name'",
                    ));
                }
            }
        }

        Ok(Self { type_name })
    }
}
